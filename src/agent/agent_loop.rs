//! Phased tool-calling loop that turns modality findings into an archived
//! final report.
//!
//! The model must search similar cases before it may submit a report, and
//! must archive the report before the loop may finish. Out-of-phase calls
//! are answered with corrective error payloads instead of failing the task.

use crate::agent::tools::{
    CaseContext, ToolOutcome, ToolRegistry, SEARCH_SIMILAR_CASES, SUBMIT_FINAL_REPORT,
    WRITE_USER_HISTORY_CASE,
};
use crate::config::Config;
use crate::llm::{ChatMessage, CompletionEndpoint, CompletionRequest, ToolCall, ToolChoice};
use crate::models::RiskLevel;
use crate::report::{fallback_report_payload, format_final_report};
use crate::retry::RetryPolicy;
use crate::store::{NewCaseRecord, TaskStore};
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Configuration for the protocol loop.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_rounds: usize,
    /// Characters of model output and tool payloads kept in logs.
    pub log_truncate: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            temperature: 0.3,
            max_tokens: 2048,
            max_rounds: 8,
            log_truncate: 240,
        }
    }
}

impl From<&Config> for AgentConfig {
    fn from(config: &Config) -> Self {
        Self {
            model: config.model.main_model.clone(),
            temperature: config.model.temperature,
            max_tokens: config.model.max_tokens,
            max_rounds: config.agent.max_rounds.max(1),
            log_truncate: config.agent.log_truncate,
        }
    }
}

/// The reasoning-model conversation for one case.
pub struct ProtocolLoop {
    config: AgentConfig,
    endpoint: Arc<dyn CompletionEndpoint>,
    tools: Arc<ToolRegistry>,
    store: Arc<TaskStore>,
    retry: RetryPolicy,
}

impl ProtocolLoop {
    pub fn new(
        config: AgentConfig,
        endpoint: Arc<dyn CompletionEndpoint>,
        tools: Arc<ToolRegistry>,
        store: Arc<TaskStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            config,
            endpoint,
            tools,
            store,
            retry,
        }
    }

    /// Drive the conversation until the report is archived.
    ///
    /// Returns the formatted report. Exhausting the round budget is an error.
    pub async fn run(&self, mut ctx: CaseContext, input: &str) -> Result<String> {
        info!(
            "Starting protocol loop for task {} with model {}",
            ctx.task_id, self.config.model
        );

        let mut messages = vec![
            ChatMessage::system(MAIN_AGENT_SYSTEM_PROMPT),
            ChatMessage::user(input),
        ];

        for round in 1..=self.config.max_rounds {
            debug!("[MainAgent][Round {}] requesting model", round);

            let request = CompletionRequest {
                model: self.config.model.clone(),
                messages: messages.clone(),
                tools: self.tools.definitions().to_vec(),
                tool_choice: Some(ToolChoice::Required),
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
            };
            let action = format!("create chat completion round {}", round);
            let response = self
                .retry
                .run("MainAgent", &action, || self.endpoint.create_completion(&request))
                .await
                .context("Main agent API error")?;

            info!(
                "[MainAgent][Round {}] reply: {} ({} tool calls)",
                round,
                truncate_for_log(&response.content, self.config.log_truncate),
                response.tool_calls.len()
            );
            messages.push(ChatMessage::assistant(
                response.content.clone(),
                response.tool_calls.clone(),
            ));

            if response.tool_calls.is_empty() {
                if ctx.final_report.is_some() {
                    warn!(
                        "[MainAgent][Round {}] report not archived yet, reminding model",
                        round
                    );
                    messages.push(ChatMessage::user(ARCHIVE_REMINDER));
                    continue;
                }
                warn!(
                    "[MainAgent][Round {}] no tool calls and no report, using fallback",
                    round
                );
                return Ok(self.archive_fallback(&ctx, &response.content));
            }

            for call in &response.tool_calls {
                debug!(
                    "[MainAgent][Round {}] calling {} with {}",
                    round,
                    call.function.name,
                    truncate_for_log(&call.function.arguments, self.config.log_truncate)
                );

                let outcome = self.dispatch(&ctx, call);
                let payload = outcome.payload.to_string();
                if outcome.is_error() {
                    info!(
                        "[MainAgent][Round {}] {} answered with error {}",
                        round,
                        call.function.name,
                        truncate_for_log(&payload, self.config.log_truncate)
                    );
                } else {
                    debug!(
                        "[MainAgent][Round {}] {} returned {}",
                        round,
                        call.function.name,
                        truncate_for_log(&payload, self.config.log_truncate)
                    );
                }
                messages.push(ChatMessage::tool_result(call.id.clone(), payload));
                ctx.apply(outcome.effect);

                if ctx.archived {
                    if let Some(report) = ctx.final_report.take() {
                        info!("[MainAgent][Round {}] report archived, finishing", round);
                        return Ok(report.text);
                    }
                }
            }
        }

        Err(anyhow!(
            "protocol loop exceeded {} rounds without archiving the final report",
            self.config.max_rounds
        ))
    }

    /// Run one tool call, enforcing the phase order first.
    fn dispatch(&self, ctx: &CaseContext, call: &ToolCall) -> ToolOutcome {
        let name = call.function.name.as_str();

        if let Some(reason) = phase_violation(ctx, name) {
            warn!("Rejected out-of-phase call to {}: {}", name, reason);
            return ToolOutcome::error(reason);
        }

        match self.tools.get(name) {
            Some(handler) => handler.handle(ctx, &call.function.arguments),
            None => {
                warn!("Unsupported tool requested: {}", name);
                ToolOutcome::error("unsupported tool")
            }
        }
    }

    /// Build, archive and return a degraded report from free text.
    fn archive_fallback(&self, ctx: &CaseContext, content: &str) -> String {
        let payload = fallback_report_payload(content);
        let report = format_final_report(&payload);

        self.store.add_case_history(
            &ctx.user_id,
            NewCaseRecord {
                record_id: Some(ctx.task_id.clone()).filter(|id| !id.trim().is_empty()),
                title: ctx.payload.derive_title(),
                case_summary: payload.summary.clone(),
                risk_level: Some(RiskLevel::Medium),
                payload: ctx.payload.clone(),
                report: report.clone(),
            },
        );
        report
    }
}

/// Why `tool` may not run in the current phase, if it may not.
fn phase_violation(ctx: &CaseContext, tool: &str) -> Option<String> {
    match tool {
        SUBMIT_FINAL_REPORT if ctx.final_report.is_some() => Some(format!(
            "a final report was already submitted; call {} to archive it",
            WRITE_USER_HISTORY_CASE
        )),
        SUBMIT_FINAL_REPORT if !ctx.has_case_search => Some(format!(
            "call {} with a non-empty query before {}",
            SEARCH_SIMILAR_CASES, SUBMIT_FINAL_REPORT
        )),
        WRITE_USER_HISTORY_CASE if ctx.final_report.is_none() => Some(format!(
            "call {} before {}",
            SUBMIT_FINAL_REPORT, WRITE_USER_HISTORY_CASE
        )),
        _ => None,
    }
}

/// Trim `input` to `max` characters for logging.
fn truncate_for_log(input: &str, max: usize) -> String {
    let text = input.trim();
    if text.is_empty() {
        return "<empty>".to_string();
    }
    if max <= 3 || text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max - 3).collect();
    out.push_str("...");
    out
}

const ARCHIVE_REMINDER: &str = "The final report has been submitted but not archived. Call write_user_history_case now.";

const MAIN_AGENT_SYSTEM_PROMPT: &str = r#"You are the lead risk analyst. You receive the user's text and the findings of the image, video and audio sub-agents for one case.

Work strictly through tools, in this order:
1. Call search_similar_cases with a query you write from the case's core features. You may also call query_user_info and query_user_history_cases.
2. Call submit_final_report exactly once with the structured assessment.
3. Call write_user_history_case to archive the case.

Do not answer in plain text. Base every finding on the provided material and mark uncertain points as such."#;
