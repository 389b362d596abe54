//! Per-task processing: modality fan-out, then the protocol loop.

use crate::agent::{AgentConfig, CaseContext, ProtocolLoop, ToolRegistry};
use crate::analysis::{analyze_batch, Base64Analyzer, ModalityAnalyzer};
use crate::config::Config;
use crate::llm::CompletionEndpoint;
use crate::models::{Modality, TaskPayload, TaskRecord};
use crate::profile::ProfileStore;
use crate::report::{format_modality_batch, ModalitySummaries};
use crate::retry::RetryPolicy;
use crate::store::TaskStore;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Turns one task into its final report.
#[async_trait]
pub trait CaseProcessor: Send + Sync {
    async fn process(&self, task: &TaskRecord) -> Result<String>;
}

/// One analyzer per media modality.
#[derive(Clone)]
pub struct Analyzers {
    pub image: Arc<dyn Base64Analyzer>,
    pub audio: Arc<dyn Base64Analyzer>,
    pub video: Arc<dyn Base64Analyzer>,
}

impl Analyzers {
    pub fn from_config(config: &Config, endpoint: Arc<dyn CompletionEndpoint>) -> Self {
        let build = |modality| -> Arc<dyn Base64Analyzer> {
            Arc::new(ModalityAnalyzer::from_config(
                modality,
                config,
                Arc::clone(&endpoint),
            ))
        };

        Self {
            image: build(Modality::Image),
            audio: build(Modality::Audio),
            video: build(Modality::Video),
        }
    }

    fn get(&self, modality: Modality) -> &Arc<dyn Base64Analyzer> {
        match modality {
            Modality::Image => &self.image,
            Modality::Audio => &self.audio,
            Modality::Video => &self.video,
        }
    }
}

/// The production [`CaseProcessor`].
pub struct CasePipeline {
    store: Arc<TaskStore>,
    analyzers: Analyzers,
    agent: ProtocolLoop,
}

impl CasePipeline {
    pub fn new(store: Arc<TaskStore>, analyzers: Analyzers, agent: ProtocolLoop) -> Self {
        Self {
            store,
            analyzers,
            agent,
        }
    }

    /// Wire analyzers, tools and the protocol loop from configuration.
    pub fn from_config(
        config: &Config,
        endpoint: Arc<dyn CompletionEndpoint>,
        store: Arc<TaskStore>,
        profiles: Arc<dyn ProfileStore>,
    ) -> Self {
        let tools = Arc::new(ToolRegistry::case_tools(Arc::clone(&store), profiles));
        let agent = ProtocolLoop::new(
            AgentConfig::from(config),
            Arc::clone(&endpoint),
            tools,
            Arc::clone(&store),
            RetryPolicy::from(&config.retry),
        );

        Self::new(store, Analyzers::from_config(config, endpoint), agent)
    }

    /// Analyze one modality; `None` when nothing was submitted for it.
    async fn run_modality(&self, modality: Modality, items: Vec<String>) -> Option<Vec<String>> {
        if items.is_empty() {
            return None;
        }
        info!("Analyzing {} {} item(s)", items.len(), modality);
        let analyzer = Arc::clone(self.analyzers.get(modality));
        Some(analyze_batch(analyzer, &modality.to_string(), items).await)
    }
}

#[async_trait]
impl CaseProcessor for CasePipeline {
    async fn process(&self, task: &TaskRecord) -> Result<String> {
        let images = non_empty_items(task.payload.media(Modality::Image));
        let audios = non_empty_items(task.payload.media(Modality::Audio));
        let videos = non_empty_items(task.payload.media(Modality::Video));

        let (image_results, video_results, audio_results) = tokio::join!(
            self.run_modality(Modality::Image, images.clone()),
            self.run_modality(Modality::Video, videos.clone()),
            self.run_modality(Modality::Audio, audios.clone()),
        );

        let mut summaries = ModalitySummaries::new(&task.payload.text);
        let image_insights = summarize(Modality::Image, image_results, &mut summaries.image);
        let video_insights = summarize(Modality::Video, video_results, &mut summaries.video);
        let audio_insights = summarize(Modality::Audio, audio_results, &mut summaries.audio);

        self.store.update_task_insights(
            &task.user_id,
            &task.task_id,
            &video_insights,
            &audio_insights,
            &image_insights,
        );

        let payload = TaskPayload {
            text: task.payload.text.trim().to_string(),
            videos,
            audios,
            images,
            video_insights,
            audio_insights,
            image_insights,
        };
        let ctx = CaseContext::new(task.user_id.clone(), task.task_id.clone(), payload);

        self.agent.run(ctx, &summaries.to_agent_input()).await
    }
}

/// Trimmed, non-empty entries of a media list.
fn non_empty_items(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Render a batch into `summary` and return its insight list.
fn summarize(modality: Modality, results: Option<Vec<String>>, summary: &mut String) -> Vec<String> {
    let Some(results) = results else {
        return Vec::new();
    };

    *summary = format_modality_batch(modality, &results);
    if results.is_empty() {
        vec![summary.clone()]
    } else {
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tools::{SEARCH_SIMILAR_CASES, SUBMIT_FINAL_REPORT, WRITE_USER_HISTORY_CASE};
    use crate::analysis::analyzer::ANALYSIS_TOOL_NAME;
    use crate::llm::mock::{tool_reply, ScriptedEndpoint};
    use crate::profile::StaticProfiles;
    use crate::report::MODALITY_NOT_PROVIDED;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.model.main_model = "main".to_string();
        config.model.image_model = "vision".to_string();
        config.retry.max_attempts = 1;
        config.retry.base_delay_ms = 1;
        config
    }

    fn pipeline(endpoint: Arc<ScriptedEndpoint>) -> (TempDir, Arc<TaskStore>, CasePipeline) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TaskStore::open(dir.path().join("state.json")));
        let profiles: Arc<dyn ProfileStore> = Arc::new(StaticProfiles::default());
        let pipeline = CasePipeline::from_config(&test_config(), endpoint, Arc::clone(&store), profiles);
        (dir, store, pipeline)
    }

    fn script_protocol(endpoint: &ScriptedEndpoint) {
        endpoint
            .push("main", tool_reply("s", SEARCH_SIMILAR_CASES, json!({"query": "test"})))
            .push("main", tool_reply("r", SUBMIT_FINAL_REPORT, json!({"summary": "ok", "risk_level": "low"})))
            .push("main", tool_reply("w", WRITE_USER_HISTORY_CASE, json!({"title": "t", "case_summary": "s", "risk_level": "low"})));
    }

    #[tokio::test]
    async fn test_image_case_is_analyzed_and_archived() {
        let endpoint = Arc::new(ScriptedEndpoint::new());
        endpoint.push(
            "vision",
            tool_reply(
                "a",
                ANALYSIS_TOOL_NAME,
                json!({"scene_judgment": "screenshot", "key_content": "QR code", "suspicious_points": []}),
            ),
        );
        script_protocol(&endpoint);
        let (_dir, store, pipeline) = pipeline(endpoint.clone());

        let img1 = "iVBORw0KGgoAAAA=".to_string();
        let task = store.create_task(
            "u1",
            TaskPayload {
                text: "test".to_string(),
                images: vec![img1.clone(), "  ".to_string()],
                ..Default::default()
            },
        );

        let report = pipeline.process(&task).await.unwrap();
        assert!(report.contains("1. Summary\nok"));

        let history = store.get_case_history("u1");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].payload.images, vec![img1]);
        assert_eq!(history[0].payload.image_insights.len(), 1);
        assert!(history[0].payload.image_insights[0].contains("QR code"));

        let main_input = endpoint.requests_for("main")[0].messages[1].content.as_text();
        assert!(main_input.contains("[Image #1]"));
        assert!(main_input.contains("[User text]\ntest"));
        assert_eq!(main_input.matches(MODALITY_NOT_PROVIDED).count(), 2);
        assert_eq!(endpoint.requests_for("vision").len(), 1);
    }

    #[tokio::test]
    async fn test_failed_item_still_reaches_the_loop() {
        let endpoint = Arc::new(ScriptedEndpoint::new());
        script_protocol(&endpoint);
        let (_dir, store, pipeline) = pipeline(endpoint.clone());

        let task = store.create_task(
            "u1",
            TaskPayload {
                images: vec!["not base64 at all!".to_string()],
                ..Default::default()
            },
        );

        pipeline.process(&task).await.unwrap();

        let history = store.get_case_history("u1");
        assert!(history[0].payload.image_insights[0].starts_with("Error: Image 1:"));
        assert!(endpoint.requests_for("vision").is_empty());
    }

    #[tokio::test]
    async fn test_insights_stored_before_loop_failure() {
        let endpoint = Arc::new(ScriptedEndpoint::new());
        endpoint.always("vision", Ok(crate::llm::types::CompletionResponse {
            content: "free text finding".to_string(),
            tool_calls: Vec::new(),
        }));
        endpoint.push("main", Err("down".to_string()));
        let (_dir, store, pipeline) = pipeline(endpoint);

        let task = store.create_task(
            "u1",
            TaskPayload {
                images: vec!["AAAA".to_string()],
                ..Default::default()
            },
        );

        assert!(pipeline.process(&task).await.is_err());
        let pending = store.get_task("u1", &task.task_id).unwrap();
        assert_eq!(pending.payload.image_insights, vec!["free text finding".to_string()]);
    }

    #[test]
    fn test_summarize() {
        let mut summary = MODALITY_NOT_PROVIDED.to_string();
        assert!(summarize(Modality::Audio, None, &mut summary).is_empty());
        assert_eq!(summary, MODALITY_NOT_PROVIDED);

        let insights = summarize(Modality::Audio, Some(Vec::new()), &mut summary);
        assert_eq!(insights, vec!["Audio analysis failed: no result returned".to_string()]);
    }
}
