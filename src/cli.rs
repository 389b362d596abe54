//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CaseGuard - multimodal case risk assessment
///
/// Submit a case made of text, images, audio and video, let the modality
/// sub-agents and the reasoning agent assess it, and browse the archived
/// reports.
///
/// Examples:
///   caseguard submit --text "Caller asked for my SMS code" --audio call.mp3
///   caseguard submit --image chat.png --image transfer.jpg --user 42
///   caseguard tasks
///   caseguard show TASK-0A1B2C3D4E5F --json
///   caseguard ask "Was my last case high risk?"
///   caseguard init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Identity the command acts for
    ///
    /// Defaults to the configured default user when not given.
    #[arg(short, long, global = true, env = "CASEGUARD_USER")]
    pub user: Option<String>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .caseguard.toml in the current directory
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Path of the JSON state snapshot
    #[arg(long, global = true, value_name = "FILE")]
    pub state_file: Option<PathBuf>,

    /// Base URL of the OpenAI-compatible API
    #[arg(long, global = true, env = "CASEGUARD_BASE_URL")]
    pub base_url: Option<String>,

    /// API key for the completion endpoint
    #[arg(long, global = true, env = "CASEGUARD_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Reasoning model driving the protocol loop
    #[arg(short, long, global = true)]
    pub model: Option<String>,

    /// Request timeout in seconds
    #[arg(long, global = true, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Round budget of the protocol loop
    #[arg(long, global = true, value_name = "ROUNDS")]
    pub max_rounds: Option<usize>,

    /// Number of queue workers
    #[arg(long, global = true, value_name = "NUM")]
    pub workers: Option<usize>,

    /// Enable verbose logging output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Submit a case and wait for its report
    Submit {
        /// Free-text description of the case
        #[arg(short, long, default_value = "")]
        text: String,

        /// Image file (repeatable)
        #[arg(long = "image", value_name = "FILE")]
        images: Vec<PathBuf>,

        /// Audio file (repeatable)
        #[arg(long = "audio", value_name = "FILE")]
        audios: Vec<PathBuf>,

        /// Video file (repeatable)
        #[arg(long = "video", value_name = "FILE")]
        videos: Vec<PathBuf>,
    },

    /// Process tasks left unfinished by a previous run
    Run,

    /// List tasks and archived cases, most recently updated first
    Tasks,

    /// List archived cases
    History,

    /// Show one task or archived case
    Show {
        /// Task or record id
        id: String,

        /// Print the full record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Ask the assistant about your cases; the answer is streamed
    Ask {
        /// Question to answer
        question: String,
    },

    /// Generate a default .caseguard.toml configuration file
    InitConfig,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let Some(ref base_url) = self.base_url {
            if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
                return Err("Base URL must start with 'http://' or 'https://'".to_string());
            }
        }

        if self.timeout == Some(0) {
            return Err("Timeout must be at least 1 second".to_string());
        }
        if self.max_rounds == Some(0) {
            return Err("Max rounds must be at least 1".to_string());
        }
        if self.workers == Some(0) {
            return Err("Workers must be at least 1".to_string());
        }

        if let Command::Submit {
            text,
            images,
            audios,
            videos,
        } = &self.command
        {
            if text.trim().is_empty() && images.is_empty() && audios.is_empty() && videos.is_empty()
            {
                return Err("Provide --text or at least one --image/--audio/--video".to_string());
            }
            for path in images.iter().chain(audios).chain(videos) {
                if !path.is_file() {
                    return Err(format!("File does not exist: {}", path.display()));
                }
            }
        }

        if let Command::Ask { question } = &self.command {
            if question.trim().is_empty() {
                return Err("Question must not be empty".to_string());
            }
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
