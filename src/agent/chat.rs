//! Conversational assistant over a user's cases.
//!
//! Lookups are resolved with plain completion calls first; the answer
//! itself is streamed.

use crate::agent::tools::{CaseContext, ToolOutcome, ToolRegistry};
use crate::agent::AgentConfig;
use crate::config::Config;
use crate::llm::{ChatMessage, CompletionEndpoint, CompletionRequest, StreamChunk, ToolChoice};
use crate::models::TaskPayload;
use crate::profile::ProfileStore;
use crate::retry::RetryPolicy;
use crate::store::TaskStore;
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Lookup rounds allowed before the answer is streamed.
const MAX_TOOL_ROUNDS: usize = 3;

const CHAT_SYSTEM_PROMPT: &str = "You are a concise, friendly assistant for a fraud risk service. When useful, call the tools to look up the user's profile, their archived cases or similar cases before answering.";

pub struct CaseChat {
    config: AgentConfig,
    endpoint: Arc<dyn CompletionEndpoint>,
    tools: Arc<ToolRegistry>,
    retry: RetryPolicy,
}

impl CaseChat {
    pub fn new(
        config: AgentConfig,
        endpoint: Arc<dyn CompletionEndpoint>,
        tools: Arc<ToolRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            config,
            endpoint,
            tools,
            retry,
        }
    }

    pub fn from_config(
        config: &Config,
        endpoint: Arc<dyn CompletionEndpoint>,
        store: Arc<TaskStore>,
        profiles: Arc<dyn ProfileStore>,
    ) -> Self {
        Self::new(
            AgentConfig::from(config),
            endpoint,
            Arc::new(ToolRegistry::chat_tools(store, profiles)),
            RetryPolicy::from(&config.retry),
        )
    }

    /// Answer `question` for `user_id`, streaming the reply into `sink`.
    pub async fn reply(
        &self,
        user_id: &str,
        question: &str,
        sink: mpsc::Sender<StreamChunk>,
    ) -> Result<()> {
        let question = question.trim();
        if question.is_empty() {
            bail!("question must not be empty");
        }

        let ctx = CaseContext::new(user_id, String::new(), TaskPayload::default());
        let mut messages = vec![
            ChatMessage::system(CHAT_SYSTEM_PROMPT),
            ChatMessage::user(question),
        ];

        for round in 1..=MAX_TOOL_ROUNDS {
            let request = self.request(messages.clone(), true);
            let action = format!("resolve chat tools round {}", round);
            let response = self
                .retry
                .run("ChatAgent", &action, || self.endpoint.create_completion(&request))
                .await
                .context("Chat agent API error")?;

            if response.tool_calls.is_empty() {
                break;
            }
            messages.push(ChatMessage::assistant(
                response.content.clone(),
                response.tool_calls.clone(),
            ));

            for call in &response.tool_calls {
                let name = call.function.name.as_str();
                debug!("[ChatAgent][Round {}] calling {}", round, name);
                let outcome = match self.tools.get(name) {
                    Some(handler) => handler.handle(&ctx, &call.function.arguments),
                    None => ToolOutcome::error("unsupported tool"),
                };
                messages.push(ChatMessage::tool_result(
                    call.id.clone(),
                    outcome.payload.to_string(),
                ));
            }
        }

        info!("[ChatAgent] streaming answer for {}", ctx.user_id);
        let request = self.request(messages, false);
        self.endpoint
            .stream_completion(&request, sink)
            .await
            .context("Chat stream failed")
    }

    fn request(&self, messages: Vec<ChatMessage>, with_tools: bool) -> CompletionRequest {
        let (tools, tool_choice) = if with_tools {
            (self.tools.definitions().to_vec(), Some(ToolChoice::Auto))
        } else {
            (Vec::new(), None)
        };

        CompletionRequest {
            model: self.config.model.clone(),
            messages,
            tools,
            tool_choice,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tools::{QUERY_USER_HISTORY_CASES, SUBMIT_FINAL_REPORT};
    use crate::llm::mock::{text_reply, tool_reply, ScriptedEndpoint};
    use crate::llm::types::Role;
    use crate::profile::StaticProfiles;
    use crate::store::NewCaseRecord;
    use serde_json::json;
    use tempfile::TempDir;

    fn chat(endpoint: Arc<ScriptedEndpoint>) -> (TempDir, Arc<TaskStore>, CaseChat) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TaskStore::open(dir.path().join("state.json")));
        let profiles: Arc<dyn ProfileStore> = Arc::new(StaticProfiles::default());
        let mut config = Config::default();
        config.model.main_model = "main".to_string();
        config.retry.max_attempts = 1;
        let chat = CaseChat::from_config(&config, endpoint, Arc::clone(&store), profiles);
        (dir, store, chat)
    }

    async fn drain(mut rx: mpsc::Receiver<StreamChunk>) -> Vec<StreamChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn test_lookup_then_streamed_answer() {
        let endpoint = Arc::new(ScriptedEndpoint::new());
        endpoint
            .push("main", tool_reply("h", QUERY_USER_HISTORY_CASES, json!({})))
            .push("main", text_reply("ready"))
            .push("main", text_reply("You have one archived case."));
        let (_dir, store, chat) = chat(endpoint.clone());
        store.add_case_history(
            "u1",
            NewCaseRecord {
                title: "Fake courier call".to_string(),
                case_summary: "asked for a refund code".to_string(),
                ..Default::default()
            },
        );

        let (tx, rx) = mpsc::channel(8);
        chat.reply("u1", " how many cases do I have? ", tx).await.unwrap();
        assert_eq!(
            drain(rx).await,
            vec![
                StreamChunk::Delta("You have one archived case.".to_string()),
                StreamChunk::Done,
            ]
        );

        let requests = endpoint.requests_for("main");
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].tool_choice, Some(ToolChoice::Auto));
        let offered: Vec<&str> = requests[0]
            .tools
            .iter()
            .map(|t| t.function.name.as_str())
            .collect();
        assert!(!offered.contains(&SUBMIT_FINAL_REPORT));

        let answer = &requests[2];
        assert!(answer.tools.is_empty());
        assert_eq!(answer.tool_choice, None);
        let tool_result = answer
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert!(tool_result.content.as_text().contains("Fake courier call"));
    }

    #[tokio::test]
    async fn test_empty_question_is_rejected() {
        let endpoint = Arc::new(ScriptedEndpoint::new());
        let (_dir, _store, chat) = chat(endpoint.clone());

        let (tx, _rx) = mpsc::channel(1);
        assert!(chat.reply("u1", "   ", tx).await.is_err());
        assert!(endpoint.requests().is_empty());
    }

    #[tokio::test]
    async fn test_lookup_failure_is_reported() {
        let endpoint = Arc::new(ScriptedEndpoint::new());
        endpoint.push("main", Err("down".to_string()));
        let (_dir, _store, chat) = chat(endpoint);

        let (tx, _rx) = mpsc::channel(1);
        let err = chat.reply("u1", "hello", tx).await.unwrap_err();
        assert!(format!("{:#}", err).contains("Chat agent API error"));
    }
}
