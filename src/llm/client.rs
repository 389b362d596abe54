//! HTTP client for OpenAI-compatible chat completion APIs.

use crate::llm::types::{
    ChatMessage, CompletionEndpoint, CompletionRequest, CompletionResponse, StreamChunk,
    ToolCall, ToolDefinition,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Chat API request body.
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "is_empty_slice")]
    tools: &'a [ToolDefinition],
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    stream: bool,
}

fn is_empty_slice<T>(items: &&[T]) -> bool {
    items.is_empty()
}

/// Chat API response body.
#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

/// One server-sent event of a streamed response.
#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Completion endpoint backed by `{base_url}/chat/completions`.
pub struct OpenAiCompatClient {
    http_client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout_seconds: u64,
}

impl OpenAiCompatClient {
    /// Create a client from the model configuration.
    pub fn new(config: &crate::config::ModelConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout_seconds: config.timeout_seconds,
        })
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn send(&self, request: &CompletionRequest, stream: bool) -> Result<reqwest::Response> {
        let body = ChatRequest {
            model: &request.model,
            messages: &request.messages,
            tools: &request.tools,
            tool_choice: request.tool_choice.map(|c| c.as_str()),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: 1.0,
            stream,
        };

        debug!(
            "Sending chat request to {} with {} messages",
            request.model,
            request.messages.len()
        );

        let mut builder = self.http_client.post(self.url()).json(&body);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                anyhow!("Request timed out after {}s", self.timeout_seconds)
            } else if e.is_connect() {
                anyhow!("Cannot connect to completion endpoint at {}", self.base_url)
            } else {
                anyhow!("Failed to send request: {}", e)
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Completion API error {}: {}", status, body));
        }

        Ok(response)
    }
}

#[async_trait]
impl CompletionEndpoint for OpenAiCompatClient {
    async fn create_completion(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let response = self.send(request, false).await?;

        let chat_response: ChatResponse = response
            .json()
            .await
            .context("Failed to parse completion response")?;

        let choice = chat_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Completion API returned empty choices"))?;

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls: choice.message.tool_calls.unwrap_or_default(),
        })
    }

    async fn stream_completion(
        &self,
        request: &CompletionRequest,
        sink: mpsc::Sender<StreamChunk>,
    ) -> Result<()> {
        let response = self.send(request, true).await?;
        forward_sse(response.bytes_stream(), sink).await
    }
}

/// Relay a server-sent event body to `sink`, always ending with `Done`.
///
/// Bytes are buffered until a full line arrives so multi-byte characters
/// split across reads are decoded intact.
async fn forward_sse<S, B, E>(body: S, sink: mpsc::Sender<StreamChunk>) -> Result<()>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
{
    futures::pin_mut!(body);
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("Failed to read completion stream")?;
        buffer.extend_from_slice(chunk.as_ref());

        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            if !relay_line(&line, &sink).await {
                return Ok(());
            }
        }
    }

    if !buffer.is_empty() && !relay_line(&buffer, &sink).await {
        return Ok(());
    }

    let _ = sink.send(StreamChunk::Done).await;
    Ok(())
}

/// Forward one raw line; `false` once streaming should stop.
async fn relay_line(line: &[u8], sink: &mpsc::Sender<StreamChunk>) -> bool {
    match parse_sse_line(&String::from_utf8_lossy(line)) {
        SseLine::Delta(text) => sink.send(StreamChunk::Delta(text)).await.is_ok(),
        SseLine::Done => {
            let _ = sink.send(StreamChunk::Done).await;
            false
        }
        SseLine::Skip => true,
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Delta(String),
    Done,
    Skip,
}

/// Interpret one line of a server-sent event stream.
fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    match serde_json::from_str::<StreamEvent>(data) {
        Ok(event) => event
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|c| !c.is_empty())
            .map(SseLine::Delta)
            .unwrap_or(SseLine::Skip),
        Err(e) => {
            debug!("Skipping unparsable stream line: {}", e);
            SseLine::Skip
        }
    }
}
