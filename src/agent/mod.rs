//! Reasoning agent for case assessment.
//!
//! This module provides the tool menu, the phased protocol loop that
//! produces and archives the final report, and a streaming assistant for
//! questions about archived cases.

pub mod agent_loop;
pub mod chat;
pub mod tools;

pub use agent_loop::{AgentConfig, ProtocolLoop};
pub use chat::CaseChat;
pub use tools::{CaseContext, ToolRegistry};
