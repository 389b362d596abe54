//! Tools offered to the reasoning model.
//!
//! Handlers receive the request-scoped [`CaseContext`] explicitly and
//! report what they changed through a [`ToolEffect`]; the protocol loop
//! owns the context and applies those effects.

use crate::llm::ToolDefinition;
use crate::models::{RiskLevel, TaskPayload};
use crate::profile::ProfileStore;
use crate::report::{format_final_report, FinalReportPayload};
use crate::store::{NewCaseRecord, TaskStore};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

pub const SEARCH_SIMILAR_CASES: &str = "search_similar_cases";
pub const QUERY_USER_INFO: &str = "query_user_info";
pub const QUERY_USER_HISTORY_CASES: &str = "query_user_history_cases";
pub const SUBMIT_FINAL_REPORT: &str = "submit_final_report";
pub const WRITE_USER_HISTORY_CASE: &str = "write_user_history_case";

/// Maximum similar cases returned per search.
const SEARCH_LIMIT: usize = 5;

/// A report accepted from the model, already formatted.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedReport {
    pub text: String,
    pub risk: RiskLevel,
}

/// Everything a tool handler may need about the case being processed.
#[derive(Debug, Clone)]
pub struct CaseContext {
    pub user_id: String,
    pub task_id: String,
    /// Original submission plus the per-modality insights.
    pub payload: TaskPayload,
    pub has_case_search: bool,
    pub final_report: Option<CapturedReport>,
    pub archived: bool,
}

impl CaseContext {
    pub fn new(user_id: impl Into<String>, task_id: impl Into<String>, payload: TaskPayload) -> Self {
        Self {
            user_id: user_id.into(),
            task_id: task_id.into(),
            payload,
            has_case_search: false,
            final_report: None,
            archived: false,
        }
    }

    /// Fold a handler's effect into the context.
    pub fn apply(&mut self, effect: ToolEffect) {
        match effect {
            ToolEffect::None => {}
            ToolEffect::CaseSearched => self.has_case_search = true,
            ToolEffect::ReportCaptured(report) => self.final_report = Some(report),
            ToolEffect::Archived => self.archived = true,
        }
    }
}

/// State change requested by a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolEffect {
    None,
    CaseSearched,
    ReportCaptured(CapturedReport),
    Archived,
}

/// JSON payload returned to the model plus the handler's effect.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub payload: Value,
    pub effect: ToolEffect,
}

impl ToolOutcome {
    pub fn ok(payload: Value) -> Self {
        Self {
            payload,
            effect: ToolEffect::None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::ok(json!({ "error": message.into() }))
    }

    pub fn with_effect(mut self, effect: ToolEffect) -> Self {
        self.effect = effect;
        self
    }

    pub fn is_error(&self) -> bool {
        self.payload.get("error").is_some()
    }
}

/// A named operation the model may invoke.
pub trait ToolHandler: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    /// Handle one call. Failures are returned as error payloads.
    fn handle(&self, ctx: &CaseContext, args: &str) -> ToolOutcome;
}

/// Immutable name → handler table, built once at startup.
#[derive(Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, Box<dyn ToolHandler>>,
    definitions: Vec<ToolDefinition>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler; later registrations replace earlier ones by name.
    pub fn register(mut self, handler: impl ToolHandler + 'static) -> Self {
        let definition = handler.definition();
        let name = definition.function.name.clone();
        self.definitions.retain(|d| d.function.name != name);
        self.definitions.push(definition);
        self.handlers.insert(name, Box::new(handler));
        self
    }

    /// The case-assessment tool menu.
    pub fn case_tools(store: Arc<TaskStore>, profiles: Arc<dyn ProfileStore>) -> Self {
        Self::new()
            .register(SearchSimilarCases {
                store: Arc::clone(&store),
            })
            .register(QueryUserHistoryCases {
                store: Arc::clone(&store),
            })
            .register(QueryUserInfo {
                store: Arc::clone(&store),
                profiles,
            })
            .register(WriteUserHistoryCase { store })
            .register(SubmitFinalReport)
    }

    /// Read-only lookups offered to the conversational assistant.
    pub fn chat_tools(store: Arc<TaskStore>, profiles: Arc<dyn ProfileStore>) -> Self {
        Self::new()
            .register(SearchSimilarCases {
                store: Arc::clone(&store),
            })
            .register(QueryUserHistoryCases {
                store: Arc::clone(&store),
            })
            .register(QueryUserInfo { store, profiles })
    }

    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.definitions
    }

    pub fn get(&self, name: &str) -> Option<&dyn ToolHandler> {
        self.handlers.get(name).map(|h| h.as_ref())
    }
}

/// Parse tool arguments; an empty string counts as `{}`.
fn parse_args<T: DeserializeOwned>(tool: &str, args: &str) -> Result<T, String> {
    let args = if args.trim().is_empty() { "{}" } else { args };
    serde_json::from_str(args).map_err(|e| format!("invalid {} arguments: {}", tool, e))
}

#[derive(Debug, Deserialize)]
struct SearchInput {
    #[serde(default)]
    query: String,
}

/// Similar archived cases across all users.
pub struct SearchSimilarCases {
    store: Arc<TaskStore>,
}

impl ToolHandler for SearchSimilarCases {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            SEARCH_SIMILAR_CASES,
            "Search archived cases similar to the current one. Write the query yourself from the case's core features, scripts, key entities and risk clues.",
            json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Description used to retrieve similar cases."
                    }
                },
                "required": ["query"]
            }),
        )
    }

    fn handle(&self, _ctx: &CaseContext, args: &str) -> ToolOutcome {
        let input: SearchInput = match parse_args(SEARCH_SIMILAR_CASES, args) {
            Ok(input) => input,
            Err(e) => return ToolOutcome::error(e),
        };
        let query = input.query.trim();
        if query.is_empty() {
            return ToolOutcome::error("query must not be empty");
        }

        let cases: Vec<Value> = self
            .store
            .search_cases(query, SEARCH_LIMIT)
            .into_iter()
            .map(|r| {
                json!({
                    "record_id": r.record_id,
                    "title": r.title,
                    "case_summary": r.case_summary,
                    "risk_level": r.risk_level,
                    "created_at": r.created_at.to_rfc3339(),
                })
            })
            .collect();
        debug!("Case search for {:?} returned {} cases", query, cases.len());

        ToolOutcome::ok(json!({ "query": query, "cases": cases }))
            .with_effect(ToolEffect::CaseSearched)
    }
}

#[derive(Debug, Deserialize)]
struct NoInput {}

/// Archived cases of the current user, one line each.
pub struct QueryUserHistoryCases {
    store: Arc<TaskStore>,
}

impl ToolHandler for QueryUserHistoryCases {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            QUERY_USER_HISTORY_CASES,
            "List the current user's historical cases. The user is taken from the request.",
            json!({ "type": "object", "properties": {} }),
        )
    }

    fn handle(&self, ctx: &CaseContext, args: &str) -> ToolOutcome {
        if let Err(e) = parse_args::<NoInput>(QUERY_USER_HISTORY_CASES, args) {
            return ToolOutcome::error(e);
        }

        let history = self.store.get_case_history(&ctx.user_id);
        let cases: Vec<String> = if history.is_empty() {
            vec!["No historical cases on record".to_string()]
        } else {
            history
                .iter()
                .map(|r| {
                    format!(
                        "{} | Title: {} | Summary: {} | Risk level: {} | Video insights: {} | Audio insights: {} | Image insights: {}",
                        r.created_at.format("%Y-%m-%d %H:%M:%S"),
                        r.title,
                        r.case_summary,
                        r.risk_level,
                        join_insights(&r.payload.video_insights),
                        join_insights(&r.payload.audio_insights),
                        join_insights(&r.payload.image_insights),
                    )
                })
                .collect()
        };

        ToolOutcome::ok(json!({ "user_id": ctx.user_id, "cases": cases }))
    }
}

fn join_insights(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join("; ")
    }
}

/// Profile and risk portrait of the current user.
pub struct QueryUserInfo {
    store: Arc<TaskStore>,
    profiles: Arc<dyn ProfileStore>,
}

impl ToolHandler for QueryUserInfo {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            QUERY_USER_INFO,
            "Get the current user's basic information and historical risk profile. The user is taken from the request.",
            json!({ "type": "object", "properties": {} }),
        )
    }

    fn handle(&self, ctx: &CaseContext, args: &str) -> ToolOutcome {
        if let Err(e) = parse_args::<NoInput>(QUERY_USER_INFO, args) {
            return ToolOutcome::error(e);
        }

        let view = self.store.get_user_state_view(&ctx.user_id);
        let age = view
            .user_id
            .trim()
            .parse::<u64>()
            .ok()
            .and_then(|id| self.profiles.lookup_age(id));

        let mut risk_counts: BTreeMap<String, usize> = [RiskLevel::Low, RiskLevel::Medium, RiskLevel::High]
            .iter()
            .map(|r| (r.to_string(), 0))
            .collect();
        let mut highest = RiskLevel::Low;
        for record in &view.history {
            *risk_counts.entry(record.risk_level.to_string()).or_default() += 1;
            highest = highest.max(record.risk_level);
        }

        ToolOutcome::ok(json!({
            "user_id": view.user_id,
            "age": age,
            "pending_task_count": view.pending.len(),
            "completed_task_count": view.history.len(),
            "historical_risk": highest,
            "risk_case_count": risk_counts,
        }))
    }
}

/// Accepts the structured final report.
pub struct SubmitFinalReport;

impl ToolHandler for SubmitFinalReport {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            SUBMIT_FINAL_REPORT,
            "Submit the final structured risk report. Only allowed after search_similar_cases.",
            json!({
                "type": "object",
                "properties": {
                    "summary": {"type": "string", "description": "One-paragraph case summary."},
                    "text_finding": {"type": "string", "description": "Key finding from the text."},
                    "image_finding": {"type": "string", "description": "Key finding from the images."},
                    "video_finding": {"type": "string", "description": "Key finding from the videos."},
                    "audio_finding": {"type": "string", "description": "Key finding from the audio."},
                    "risk_signals": {"type": "array", "items": {"type": "string"}, "description": "Risk signals, one per item."},
                    "risk_level": {"type": "string", "enum": ["low", "medium", "high"], "description": "Preliminary risk level."},
                    "risk_reason": {"type": "string", "description": "Reason for the risk level."},
                    "next_actions": {"type": "array", "items": {"type": "string"}, "description": "Recommended next verification steps."}
                },
                "required": [
                    "summary", "text_finding", "image_finding", "video_finding", "audio_finding",
                    "risk_signals", "risk_level", "risk_reason", "next_actions"
                ]
            }),
        )
    }

    fn handle(&self, _ctx: &CaseContext, args: &str) -> ToolOutcome {
        let payload: FinalReportPayload = match parse_args(SUBMIT_FINAL_REPORT, args) {
            Ok(payload) => payload,
            Err(e) => return ToolOutcome::error(e),
        };

        let report = CapturedReport {
            text: format_final_report(&payload),
            risk: payload.risk(),
        };

        ToolOutcome::ok(json!({
            "status": "success",
            "message": "final report submitted; archive it with write_user_history_case",
        }))
        .with_effect(ToolEffect::ReportCaptured(report))
    }
}

#[derive(Debug, Deserialize)]
struct WriteCaseInput {
    #[serde(default)]
    title: String,
    #[serde(default)]
    case_summary: String,
    #[serde(default)]
    risk_level: String,
}

/// Archives the case with the captured report.
pub struct WriteUserHistoryCase {
    store: Arc<TaskStore>,
}

impl ToolHandler for WriteUserHistoryCase {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            WRITE_USER_HISTORY_CASE,
            "Archive the current case into the user's history. Only allowed after submit_final_report.",
            json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string", "description": "Case title."},
                    "case_summary": {"type": "string", "description": "Case summary."},
                    "risk_level": {"type": "string", "enum": ["low", "medium", "high"], "description": "Risk level."}
                },
                "required": ["title", "case_summary", "risk_level"]
            }),
        )
    }

    fn handle(&self, ctx: &CaseContext, args: &str) -> ToolOutcome {
        let input: WriteCaseInput = match parse_args(WRITE_USER_HISTORY_CASE, args) {
            Ok(input) => input,
            Err(e) => return ToolOutcome::error(e),
        };
        let Some(report) = ctx.final_report.as_ref() else {
            return ToolOutcome::error("no final report has been submitted");
        };

        let risk_level = RiskLevel::parse(&input.risk_level).unwrap_or(report.risk);
        let record = self.store.add_case_history(
            &ctx.user_id,
            NewCaseRecord {
                record_id: Some(ctx.task_id.clone()).filter(|id| !id.trim().is_empty()),
                title: input.title,
                case_summary: input.case_summary,
                risk_level: Some(risk_level),
                payload: ctx.payload.clone(),
                report: report.text.clone(),
            },
        );

        ToolOutcome::ok(json!({
            "status": "success",
            "record_id": record.record_id,
            "user_id": record.user_id,
            "title": record.title,
            "risk_level": record.risk_level,
            "created_at": record.created_at.to_rfc3339(),
        }))
        .with_effect(ToolEffect::Archived)
    }
}
