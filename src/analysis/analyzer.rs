//! Per-item modality analysis through one completion call.

use crate::analysis::media::{self, MediaPayload};
use crate::config::Config;
use crate::llm::{
    ChatMessage, CompletionEndpoint, CompletionRequest, ContentPart, InputAudio, MediaUrl,
    ToolChoice, ToolDefinition,
};
use crate::models::Modality;
use crate::report::{format_analysis_finding, AnalysisFinding};
use crate::retry::RetryPolicy;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Tool the analysis model must call with its structured finding.
pub const ANALYSIS_TOOL_NAME: &str = "submit_analysis_result";

/// Analyzes one base64 media item; `index` is its position in the batch.
#[async_trait]
pub trait Base64Analyzer: Send + Sync {
    async fn analyze(&self, data: &str, index: usize) -> Result<String>;
}

/// Completion-backed analyzer for one modality.
pub struct ModalityAnalyzer {
    modality: Modality,
    model: String,
    endpoint: Arc<dyn CompletionEndpoint>,
    retry: RetryPolicy,
    temperature: f32,
    max_tokens: u32,
}

impl ModalityAnalyzer {
    pub fn new(
        modality: Modality,
        model: impl Into<String>,
        endpoint: Arc<dyn CompletionEndpoint>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            modality,
            model: model.into(),
            endpoint,
            retry,
            temperature: 0.5,
            max_tokens: 1024,
        }
    }

    /// Analyzer for `modality` using the models and limits from `config`.
    pub fn from_config(
        modality: Modality,
        config: &Config,
        endpoint: Arc<dyn CompletionEndpoint>,
    ) -> Self {
        let model = match modality {
            Modality::Image => &config.model.image_model,
            Modality::Audio => &config.model.audio_model,
            Modality::Video => &config.model.video_model,
        };

        Self {
            temperature: config.model.analysis_temperature,
            max_tokens: config.model.analysis_max_tokens,
            ..Self::new(modality, model.clone(), endpoint, RetryPolicy::from(&config.retry))
        }
    }

    fn build_request(&self, payload: &MediaPayload) -> CompletionRequest {
        let media_part = match self.modality {
            Modality::Image => ContentPart::ImageUrl {
                image_url: MediaUrl {
                    url: payload.data_url(media::sniff_image_mime(&payload.bytes)),
                },
            },
            Modality::Video => ContentPart::VideoUrl {
                video_url: MediaUrl {
                    url: payload.data_url("video/mp4"),
                },
            },
            Modality::Audio => {
                let format = payload
                    .declared_mime
                    .as_deref()
                    .and_then(media::audio_format_from_mime)
                    .unwrap_or_else(|| media::sniff_audio_format(&payload.bytes));
                ContentPart::InputAudio {
                    input_audio: InputAudio {
                        data: payload.base64.clone(),
                        format: format.to_string(),
                    },
                }
            }
        };

        CompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage::system(system_prompt(self.modality)),
                ChatMessage::user_parts(vec![
                    ContentPart::Text {
                        text: user_instruction(self.modality).to_string(),
                    },
                    media_part,
                ]),
            ],
            tools: vec![analysis_tool_definition()],
            tool_choice: Some(ToolChoice::Required),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

#[async_trait]
impl Base64Analyzer for ModalityAnalyzer {
    async fn analyze(&self, data: &str, index: usize) -> Result<String> {
        let label = self.modality.label();
        let number = index + 1;

        let payload =
            media::decode(data).map_err(|e| anyhow!("{} {}: {}", label, number, e))?;
        let request = self.build_request(&payload);

        let agent_name = format!("{}Agent", label);
        let action = format!("create chat completion for {} {}", self.modality, number);
        let response = self
            .retry
            .run(&agent_name, &action, || self.endpoint.create_completion(&request))
            .await
            .with_context(|| format!("{} {}: API error", label, number))?;

        if let Some(call) = response.tool_calls.first() {
            let finding: AnalysisFinding = serde_json::from_str(&call.function.arguments)
                .with_context(|| format!("{} {}: invalid {} arguments", label, number, call.function.name))?;
            debug!("{} {} analyzed via tool call", label, number);
            return Ok(format_analysis_finding(&finding));
        }

        let content = response.content.trim();
        if content.is_empty() {
            return Err(anyhow!("{} {}: no content returned", label, number));
        }
        debug!("{} {} answered in free text", label, number);
        Ok(content.to_string())
    }
}

/// Definition of the structured-finding tool.
pub fn analysis_tool_definition() -> ToolDefinition {
    ToolDefinition::function(
        ANALYSIS_TOOL_NAME,
        "Submit the analysis result: scene or source judgment, key content and suspicious points.",
        json!({
            "type": "object",
            "properties": {
                "scene_judgment": {
                    "type": "string",
                    "description": "What kind of material this is (real photo, screen capture, UI screenshot, rendered or synthetic content, recorded call, ...) and its overall style."
                },
                "key_content": {
                    "type": "string",
                    "description": "Objective content: visible or spoken text, app names, URLs, amounts, phone numbers, institutions, core scene."
                },
                "suspicious_points": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Observed anomalies, one per item, without a final verdict."
                }
            },
            "required": ["scene_judgment", "key_content", "suspicious_points"]
        }),
    )
}

fn system_prompt(modality: Modality) -> String {
    let focus = match modality {
        Modality::Image => "Decide whether the image is a real-world photo, a photo of a screen, a UI screenshot or a rendered/game scene. Look for high-risk visual patterns such as aggressive colors, pop-ups and crude imitation of known brands.",
        Modality::Video => "Describe the scenes, on-screen text and speech. Note signs of staging, screen recording, face swapping or scripted persuasion.",
        Modality::Audio => "Transcribe the key speech, identify speakers and tone, and note signs of synthetic voices, impersonation, pressure or requests for money and codes.",
    };

    format!(
        "You are a risk-control analyst for {} content. {} Extract the objective information and list suspicious points neutrally. You must call the `{}` tool; do not answer in plain text.",
        modality, focus, ANALYSIS_TOOL_NAME
    )
}

fn user_instruction(modality: Modality) -> &'static str {
    match modality {
        Modality::Image => "Extract the text, scene and suspicious visual features of this image.",
        Modality::Video => "Extract the scenes, text, speech and suspicious features of this video.",
        Modality::Audio => "Extract the speech content and suspicious features of this audio clip.",
    }
}
