//! Completion endpoint integration.
//!
//! Provides the message types, the [`CompletionEndpoint`] seam and the
//! OpenAI-compatible HTTP implementation.

pub mod client;
pub mod types;

#[cfg(test)]
pub mod mock;

pub use client::OpenAiCompatClient;
pub use types::{
    ChatMessage, CompletionEndpoint, CompletionRequest, ContentPart, InputAudio, MediaUrl,
    StreamChunk, ToolCall, ToolChoice, ToolDefinition,
};
