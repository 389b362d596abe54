//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.caseguard.toml` files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = ".caseguard.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Completion endpoint and model settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Retry policy for every remote call.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Protocol loop settings.
    #[serde(default)]
    pub agent: AgentSettings,

    /// Task queue settings.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Static user profile table.
    #[serde(default)]
    pub profiles: ProfilesConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Path of the JSON snapshot holding tasks and case history.
    #[serde(default = "default_state_file")]
    pub state_file: String,

    /// Identity used when the caller supplies none.
    #[serde(default = "default_user")]
    pub default_user: String,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            default_user: default_user(),
            verbose: false,
        }
    }
}

fn default_state_file() -> String {
    "data/caseguard_state.json".to_string()
}

fn default_user() -> String {
    crate::models::DEFAULT_USER_ID.to_string()
}

/// Completion endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Base URL of the OpenAI-compatible API (without `/chat/completions`).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bearer token for the API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Reasoning model driving the protocol loop.
    #[serde(default = "default_main_model")]
    pub main_model: String,

    /// Vision model for images.
    #[serde(default = "default_image_model")]
    pub image_model: String,

    /// Audio-capable model.
    #[serde(default = "default_audio_model")]
    pub audio_model: String,

    /// Video-capable model.
    #[serde(default = "default_video_model")]
    pub video_model: String,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Temperature for the reasoning model.
    #[serde(default = "default_main_temperature")]
    pub temperature: f32,

    /// Temperature for the modality analyzers.
    #[serde(default = "default_analysis_temperature")]
    pub analysis_temperature: f32,

    /// Maximum tokens per reasoning response.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Maximum tokens per modality finding.
    #[serde(default = "default_analysis_max_tokens")]
    pub analysis_max_tokens: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            main_model: default_main_model(),
            image_model: default_image_model(),
            audio_model: default_audio_model(),
            video_model: default_video_model(),
            timeout_seconds: default_timeout(),
            temperature: default_main_temperature(),
            analysis_temperature: default_analysis_temperature(),
            max_tokens: default_max_tokens(),
            analysis_max_tokens: default_analysis_max_tokens(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_main_model() -> String {
    "gpt-4o".to_string()
}

fn default_image_model() -> String {
    "gpt-4o".to_string()
}

fn default_audio_model() -> String {
    "gpt-4o-audio-preview".to_string()
}

fn default_video_model() -> String {
    "gpt-4o".to_string()
}

fn default_timeout() -> u64 {
    300
}

fn default_main_temperature() -> f32 {
    0.3
}

fn default_analysis_temperature() -> f32 {
    0.5
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_analysis_max_tokens() -> u32 {
    1024
}

/// Retry settings for remote calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per call.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Linear backoff unit in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

fn default_max_attempts() -> usize {
    3
}

fn default_base_delay_ms() -> u64 {
    2000
}

/// Protocol loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Round budget before the task fails.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,

    /// Characters of model output and tool payloads kept in logs.
    #[serde(default = "default_log_truncate")]
    pub log_truncate: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            log_truncate: default_log_truncate(),
        }
    }
}

fn default_max_rounds() -> usize {
    8
}

fn default_log_truncate() -> usize {
    240
}

/// Task queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queued tasks accepted before submissions are rejected.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Number of workers consuming the queue.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            workers: default_workers(),
        }
    }
}

fn default_capacity() -> usize {
    16
}

fn default_workers() -> usize {
    2
}

/// Ages keyed by numeric user id, consumed by the profile tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfilesConfig {
    #[serde(default)]
    pub ages: BTreeMap<String, u32>,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE_NAME);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings and only
    /// override when they were given.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref state_file) = args.state_file {
            self.general.state_file = state_file.display().to_string();
        }
        if let Some(ref base_url) = args.base_url {
            self.model.base_url = base_url.clone();
        }
        if let Some(ref api_key) = args.api_key {
            self.model.api_key = Some(api_key.clone());
        }
        if let Some(ref model) = args.model {
            self.model.main_model = model.clone();
        }
        if let Some(timeout) = args.timeout {
            self.model.timeout_seconds = timeout;
        }
        if let Some(rounds) = args.max_rounds {
            self.agent.max_rounds = rounds;
        }
        if let Some(workers) = args.workers {
            self.queue.workers = workers;
        }

        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.agent.max_rounds, 8);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 2000);
        assert_eq!(config.queue.capacity, 16);
        assert_eq!(config.general.default_user, "demo-user");
    }

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[general]
state_file = "/var/lib/caseguard/state.json"

[model]
base_url = "http://localhost:8000/v1"
main_model = "glm-5"
temperature = 0.2

[retry]
max_attempts = 5

[queue]
capacity = 4
workers = 1

[profiles.ages]
"42" = 67
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.general.state_file, "/var/lib/caseguard/state.json");
        assert_eq!(config.model.base_url, "http://localhost:8000/v1");
        assert_eq!(config.model.main_model, "glm-5");
        assert_eq!(config.model.temperature, 0.2);
        assert_eq!(config.model.image_model, "gpt-4o");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 2000);
        assert_eq!(config.queue.capacity, 4);
        assert_eq!(config.queue.workers, 1);
        assert_eq!(config.profiles.ages.get("42"), Some(&67));
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(!toml_str.is_empty());
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[model]"));
        assert!(toml_str.contains("[retry]"));
        assert!(toml_str.contains("[queue]"));
    }
}
