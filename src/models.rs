//! Data models for the case pipeline.
//!
//! This module contains the records owned by the task store, the
//! lightweight views handed to readers, and the small enums shared by
//! the analyzers and the protocol loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Placeholder identity used when the caller supplies none.
pub const DEFAULT_USER_ID: &str = "demo-user";

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Whether the task has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Processing => write!(f, "processing"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Risk level attached to an archived case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Parse a risk level, accepting both the Chinese and English labels.
    ///
    /// Returns `None` for anything unrecognized so callers can pick their
    /// own fallback.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "低" | "low" => Some(RiskLevel::Low),
            "中" | "med" | "medium" => Some(RiskLevel::Medium),
            "高" | "high" => Some(RiskLevel::High),
            _ => None,
        }
    }

    /// Parse a risk level, falling back to `Medium`.
    pub fn parse_or_medium(s: &str) -> Self {
        Self::parse(s).unwrap_or(RiskLevel::Medium)
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

/// A media modality analyzed by its own sub-agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modality {
    Image,
    Audio,
    Video,
}

impl Modality {
    /// Human-readable label used in rendered findings.
    pub fn label(&self) -> &'static str {
        match self {
            Modality::Image => "Image",
            Modality::Audio => "Audio",
            Modality::Video => "Video",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modality::Image => write!(f, "image"),
            Modality::Audio => write!(f, "audio"),
            Modality::Video => write!(f, "video"),
        }
    }
}

/// The submitted case content plus per-item findings.
///
/// Insight lists line up index-for-index with their payload list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub text: String,
    #[serde(default)]
    pub videos: Vec<String>,
    #[serde(default)]
    pub audios: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub video_insights: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audio_insights: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_insights: Vec<String>,
}

impl TaskPayload {
    /// Returns true when there is no text and no media at all.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
            && self.videos.is_empty()
            && self.audios.is_empty()
            && self.images.is_empty()
    }

    /// Media items of one modality.
    pub fn media(&self, modality: Modality) -> &[String] {
        match modality {
            Modality::Image => &self.images,
            Modality::Audio => &self.audios,
            Modality::Video => &self.videos,
        }
    }

    /// Title derived from the submission: the text cut to 24 characters,
    /// or a modality-count summary when there is no text.
    pub fn derive_title(&self) -> String {
        let text = self.text.trim();
        if !text.is_empty() {
            return truncate_chars(text, 24);
        }
        format!(
            "Multimodal case (V{}/A{}/I{})",
            self.videos.len(),
            self.audios.len(),
            self.images.len()
        )
    }
}

/// A task tracked through pending/processing/completed/failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub user_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub payload: TaskPayload,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub report: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// An archived case, newest first in each user's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseHistoryRecord {
    pub record_id: String,
    pub user_id: String,
    pub title: String,
    pub case_summary: String,
    pub risk_level: RiskLevel,
    pub created_at: DateTime<Utc>,
    pub payload: TaskPayload,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub report: String,
    /// Set only for records synthesized from a failed task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CaseHistoryRecord {
    /// Status the originating task ended with.
    pub fn status(&self) -> TaskStatus {
        if self.error.is_some() {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        }
    }

    /// Present the archived case as a task detail record.
    pub fn to_task_record(&self) -> TaskRecord {
        let report = if self.error.is_some() {
            String::new()
        } else if self.report.trim().is_empty() {
            self.case_summary.trim().to_string()
        } else {
            self.report.trim().to_string()
        };

        TaskRecord {
            task_id: self.record_id.clone(),
            user_id: self.user_id.clone(),
            title: self.title.clone(),
            status: self.status(),
            created_at: self.created_at,
            updated_at: self.created_at,
            payload: self.payload.clone(),
            report,
            error: self.error.clone().unwrap_or_default(),
        }
    }
}

/// Snapshot of one user's state handed to readers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStateView {
    pub user_id: String,
    pub pending: BTreeMap<String, TaskRecord>,
    pub history: Vec<CaseHistoryRecord>,
}

/// Lightweight entry of the polling list (no payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskListItem {
    pub task_id: String,
    pub user_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&TaskRecord> for TaskListItem {
    fn from(task: &TaskRecord) -> Self {
        Self {
            task_id: task.task_id.clone(),
            user_id: task.user_id.clone(),
            title: task.title.clone(),
            status: task.status,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

impl From<&CaseHistoryRecord> for TaskListItem {
    fn from(record: &CaseHistoryRecord) -> Self {
        Self {
            task_id: record.record_id.clone(),
            user_id: record.user_id.clone(),
            title: record.title.clone(),
            status: record.status(),
            created_at: record.created_at,
            updated_at: record.created_at,
        }
    }
}

/// Trim a user id, substituting the placeholder identity when empty.
pub fn normalize_user_id(user_id: &str) -> String {
    let trimmed = user_id.trim();
    if trimmed.is_empty() {
        DEFAULT_USER_ID.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Cut `s` to at most `max` characters, appending `...` when cut.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_level_parse() {
        assert_eq!(RiskLevel::parse("高"), Some(RiskLevel::High));
        assert_eq!(RiskLevel::parse(" Med "), Some(RiskLevel::Medium));
        assert_eq!(RiskLevel::parse("LOW"), Some(RiskLevel::Low));
        assert_eq!(RiskLevel::parse("severe"), None);
        assert_eq!(RiskLevel::parse_or_medium(""), RiskLevel::Medium);
    }

    #[test]
    fn test_derive_title() {
        let payload = TaskPayload {
            text: "  short text  ".to_string(),
            ..Default::default()
        };
        assert_eq!(payload.derive_title(), "short text");

        let long = TaskPayload {
            text: "a".repeat(30),
            ..Default::default()
        };
        assert_eq!(long.derive_title(), format!("{}...", "a".repeat(24)));

        let media_only = TaskPayload {
            images: vec!["x".to_string(), "y".to_string()],
            audios: vec!["z".to_string()],
            ..Default::default()
        };
        assert_eq!(media_only.derive_title(), "Multimodal case (V0/A1/I2)");
    }

    #[test]
    fn test_truncate_counts_characters() {
        assert_eq!(truncate_chars("你好世界", 2), "你好...");
        assert_eq!(truncate_chars("你好", 2), "你好");
    }

    #[test]
    fn test_normalize_user_id() {
        assert_eq!(normalize_user_id("  "), DEFAULT_USER_ID);
        assert_eq!(normalize_user_id(" u1 "), "u1");
    }

    #[test]
    fn test_history_record_as_task() {
        let record = CaseHistoryRecord {
            record_id: "TASK-1".to_string(),
            user_id: "u1".to_string(),
            title: "t".to_string(),
            case_summary: "summary".to_string(),
            risk_level: RiskLevel::High,
            created_at: Utc::now(),
            payload: TaskPayload::default(),
            report: String::new(),
            error: None,
        };
        let task = record.to_task_record();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.report, "summary");
        assert!(task.error.is_empty());

        let failed = CaseHistoryRecord {
            error: Some("boom".to_string()),
            ..record
        };
        let task = failed.to_task_record();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.report.is_empty());
        assert_eq!(task.error, "boom");
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }
}
