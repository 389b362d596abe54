//! Scripted completion endpoint for tests.

use crate::llm::types::{
    CompletionEndpoint, CompletionRequest, CompletionResponse, FunctionCall, ToolCall,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// A canned reply: a response or an error message.
pub type Scripted = Result<CompletionResponse, String>;

/// Replays queued replies per model id and records every request.
#[derive(Default)]
pub struct ScriptedEndpoint {
    replies: Mutex<HashMap<String, VecDeque<Scripted>>>,
    fallback: Mutex<HashMap<String, Scripted>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for `model`.
    pub fn push(&self, model: &str, reply: Scripted) -> &Self {
        self.replies
            .lock()
            .unwrap()
            .entry(model.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Reply used for `model` once its queue is empty.
    pub fn always(&self, model: &str, reply: Scripted) -> &Self {
        self.fallback
            .lock()
            .unwrap()
            .insert(model.to_string(), reply);
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, model: &str) -> Vec<CompletionRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.model == model)
            .collect()
    }
}

#[async_trait]
impl CompletionEndpoint for ScriptedEndpoint {
    async fn create_completion(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        self.requests.lock().unwrap().push(request.clone());

        let queued = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&request.model)
            .and_then(|q| q.pop_front());
        let reply = match queued {
            Some(reply) => reply,
            None => self
                .fallback
                .lock()
                .unwrap()
                .get(&request.model)
                .cloned()
                .ok_or_else(|| anyhow!("no scripted reply for model {}", request.model))?,
        };

        reply.map_err(|e| anyhow!(e))
    }
}

/// A reply that calls one tool.
pub fn tool_reply(id: &str, name: &str, arguments: serde_json::Value) -> Scripted {
    Ok(CompletionResponse {
        content: String::new(),
        tool_calls: vec![tool_call(id, name, arguments)],
    })
}

/// A reply that calls several tools in one turn.
pub fn multi_tool_reply(calls: Vec<ToolCall>) -> Scripted {
    Ok(CompletionResponse {
        content: String::new(),
        tool_calls: calls,
    })
}

pub fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        call_type: "function".to_string(),
        function: FunctionCall {
            name: name.to_string(),
            arguments: arguments.to_string(),
        },
    }
}

/// A plain-text reply without tool calls.
pub fn text_reply(content: &str) -> Scripted {
    Ok(CompletionResponse {
        content: content.to_string(),
        tool_calls: Vec::new(),
    })
}
