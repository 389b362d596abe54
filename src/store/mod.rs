//! Durable task and case-history store.
//!
//! One process-wide mutex guards every user's pending tasks and history.
//! Each mutation rewrites the whole snapshot file while the lock is held,
//! and readers always receive owned copies.

pub mod search;
pub mod snapshot;

use crate::models::{
    normalize_user_id, truncate_chars, CaseHistoryRecord, RiskLevel, TaskListItem, TaskPayload,
    TaskRecord, TaskStatus, UserStateView,
};
use chrono::Utc;
use rand::Rng;
use snapshot::UserState;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// Title used when an archived case has neither a title nor a summary.
pub const UNTITLED_CASE: &str = "Untitled case";

/// Summary stored for a failure without a message.
const DEFAULT_FAILURE_REASON: &str = "Task execution failed";

/// Fields supplied when archiving a case.
#[derive(Debug, Clone, Default)]
pub struct NewCaseRecord {
    /// Originating task id; a fresh id is generated when absent.
    pub record_id: Option<String>,
    pub title: String,
    pub case_summary: String,
    pub risk_level: Option<RiskLevel>,
    pub payload: TaskPayload,
    pub report: String,
}

/// Process-wide task store backed by a JSON snapshot.
pub struct TaskStore {
    path: PathBuf,
    users: Mutex<BTreeMap<String, UserState>>,
}

impl TaskStore {
    /// Open the store, loading the snapshot at `path` when present.
    ///
    /// An unreadable snapshot is logged and the store starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let users = match snapshot::load(&path) {
            Ok(users) => {
                debug!("Loaded state for {} users from {}", users.len(), path.display());
                users
            }
            Err(e) => {
                error!("Failed to load state, starting empty: {:#}", e);
                BTreeMap::new()
            }
        };

        Self {
            path,
            users: Mutex::new(users),
        }
    }

    /// Location of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, UserState>> {
        self.users.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write the snapshot; failures are logged and memory stays authoritative.
    fn persist(&self, users: &BTreeMap<String, UserState>) {
        if let Err(e) = snapshot::persist(&self.path, users) {
            error!("Failed to persist state: {:#}", e);
        }
    }

    /// Create a `pending` task for `user_id` and return a copy of it.
    pub fn create_task(&self, user_id: &str, payload: TaskPayload) -> TaskRecord {
        let uid = normalize_user_id(user_id);
        let now = Utc::now();

        let mut users = self.lock();
        let task = TaskRecord {
            task_id: unique_id(&users),
            user_id: uid.clone(),
            title: payload.derive_title(),
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            payload,
            report: String::new(),
            error: String::new(),
        };

        users
            .entry(uid)
            .or_default()
            .pending
            .insert(task.task_id.clone(), task.clone());
        self.persist(&users);

        info!("Created task {} for {}", task.task_id, task.user_id);
        task
    }

    /// Move a pending task to `processing`. No-op when unknown.
    pub fn mark_task_processing(&self, user_id: &str, task_id: &str) {
        let uid = normalize_user_id(user_id);
        let mut users = self.lock();

        let Some(task) = pending_mut(&mut users, &uid, task_id) else {
            return;
        };
        task.status = TaskStatus::Processing;
        task.updated_at = Utc::now();
        self.persist(&users);
    }

    /// Complete a task: attach the report and drop it from pending.
    ///
    /// No-op when the task is no longer pending, e.g. because archiving
    /// already retired it.
    pub fn mark_task_completed(&self, user_id: &str, task_id: &str, report: &str) {
        let uid = normalize_user_id(user_id);
        let mut users = self.lock();

        let Some(state) = users.get_mut(&uid) else {
            return;
        };
        let Some(mut task) = state.pending.remove(task_id) else {
            return;
        };
        task.status = TaskStatus::Completed;
        task.report = report.trim().to_string();
        task.updated_at = Utc::now();

        // A completed task with no archived case still has to stay visible.
        if !state.history.iter().any(|h| h.record_id == task.task_id) {
            let record = history_from_task(&uid, &task, None);
            state.history.insert(0, record);
        }
        self.persist(&users);
    }

    /// Fail a task: drop it from pending and prepend a failure record.
    pub fn mark_task_failed(&self, user_id: &str, task_id: &str, reason: &str) {
        let uid = normalize_user_id(user_id);
        let mut users = self.lock();

        let Some(state) = users.get_mut(&uid) else {
            return;
        };
        let Some(mut task) = state.pending.remove(task_id) else {
            return;
        };

        let reason = match reason.trim() {
            "" => DEFAULT_FAILURE_REASON,
            r => r,
        };
        task.status = TaskStatus::Failed;
        task.error = reason.to_string();
        task.updated_at = Utc::now();

        let record = history_from_task(&uid, &task, Some(reason));
        state.history.insert(0, record);
        self.persist(&users);

        info!("Task {} failed: {}", task_id, reason);
    }

    /// Replace the insight lists of a still-pending task.
    pub fn update_task_insights(
        &self,
        user_id: &str,
        task_id: &str,
        video_insights: &[String],
        audio_insights: &[String],
        image_insights: &[String],
    ) {
        let uid = normalize_user_id(user_id);
        let mut users = self.lock();

        let Some(task) = pending_mut(&mut users, &uid, task_id.trim()) else {
            return;
        };
        task.payload.video_insights = video_insights.to_vec();
        task.payload.audio_insights = audio_insights.to_vec();
        task.payload.image_insights = image_insights.to_vec();
        task.updated_at = Utc::now();
        self.persist(&users);
    }

    /// A pending or processing task.
    pub fn get_task(&self, user_id: &str, task_id: &str) -> Option<TaskRecord> {
        let uid = normalize_user_id(user_id);
        self.lock()
            .get(&uid)
            .and_then(|state| state.pending.get(task_id))
            .cloned()
    }

    /// A task by id, looked up in pending first and then in history.
    pub fn get_task_detail_by_id(&self, user_id: &str, id: &str) -> Option<TaskRecord> {
        let uid = normalize_user_id(user_id);
        let id = id.trim();
        if id.is_empty() {
            return None;
        }

        let users = self.lock();
        let state = users.get(&uid)?;
        if let Some(task) = state.pending.get(id) {
            return Some(task.clone());
        }
        state
            .history
            .iter()
            .find(|h| h.record_id.trim() == id)
            .map(CaseHistoryRecord::to_task_record)
    }

    /// Full snapshot of one user's pending tasks and history.
    pub fn get_user_state_view(&self, user_id: &str) -> UserStateView {
        let uid = normalize_user_id(user_id);
        let users = self.lock();
        let state = users.get(&uid).cloned().unwrap_or_default();

        UserStateView {
            user_id: uid,
            pending: state.pending,
            history: state.history,
        }
    }

    /// Archive a case at the front of the user's history.
    ///
    /// When the record id names one of the user's pending tasks, that task
    /// is retired in the same step so the id is never in both places.
    /// History is append-only: an id that is already archived keeps its
    /// first record, which is returned unchanged.
    pub fn add_case_history(&self, user_id: &str, case: NewCaseRecord) -> CaseHistoryRecord {
        let uid = normalize_user_id(user_id);
        let mut users = self.lock();

        let record_id = match case.record_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => unique_id(&users),
        };

        let record = CaseHistoryRecord {
            record_id: record_id.clone(),
            user_id: uid.clone(),
            title: case_title(&case.title, &case.case_summary),
            case_summary: case.case_summary.trim().to_string(),
            risk_level: case.risk_level.unwrap_or(RiskLevel::Medium),
            created_at: Utc::now(),
            payload: TaskPayload {
                text: case.payload.text.trim().to_string(),
                ..case.payload
            },
            report: case.report.trim().to_string(),
            error: None,
        };

        let state = users.entry(uid).or_default();
        let retired = state.pending.remove(&record_id).is_some();
        if retired {
            debug!("Archived case retires pending task {}", record_id);
        }

        let existing = state
            .history
            .iter()
            .find(|h| h.record_id == record_id)
            .cloned();
        if let Some(existing) = existing {
            warn!("Case {} is already archived, keeping the first record", record_id);
            if retired {
                self.persist(&users);
            }
            return existing;
        }

        state.history.insert(0, record.clone());
        self.persist(&users);

        info!("Archived case {} ({})", record.record_id, record.risk_level);
        record
    }

    /// The user's archived cases, newest first.
    pub fn get_case_history(&self, user_id: &str) -> Vec<CaseHistoryRecord> {
        let uid = normalize_user_id(user_id);
        self.lock()
            .get(&uid)
            .map(|state| state.history.clone())
            .unwrap_or_default()
    }

    /// Polling view: pending tasks merged with history, most recently
    /// updated first.
    pub fn list_tasks(&self, user_id: &str) -> Vec<TaskListItem> {
        let uid = normalize_user_id(user_id);
        let users = self.lock();
        let Some(state) = users.get(&uid) else {
            return Vec::new();
        };

        let mut items: Vec<TaskListItem> = state
            .pending
            .values()
            .map(TaskListItem::from)
            .chain(state.history.iter().map(TaskListItem::from))
            .collect();
        items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        items
    }

    /// Archived cases across all users most similar to `query`.
    pub fn search_cases(&self, query: &str, limit: usize) -> Vec<CaseHistoryRecord> {
        let users = self.lock();
        let records = users
            .values()
            .flat_map(|state| state.history.iter())
            .filter(|r| r.error.is_none());
        search::rank(query, records, limit)
    }

    /// Every task not yet terminal, oldest first.
    pub fn pending_tasks(&self) -> Vec<TaskRecord> {
        let users = self.lock();
        let mut tasks: Vec<TaskRecord> = users
            .values()
            .flat_map(|state| state.pending.values().cloned())
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }
}

fn pending_mut<'a>(
    users: &'a mut BTreeMap<String, UserState>,
    user_id: &str,
    task_id: &str,
) -> Option<&'a mut TaskRecord> {
    users.get_mut(user_id)?.pending.get_mut(task_id)
}

/// History record synthesized from a terminal task.
fn history_from_task(user_id: &str, task: &TaskRecord, failure: Option<&str>) -> CaseHistoryRecord {
    let (summary, report) = match failure {
        Some(reason) => (reason.to_string(), String::new()),
        None => (truncate_chars(&task.report, 120), task.report.clone()),
    };

    CaseHistoryRecord {
        record_id: task.task_id.clone(),
        user_id: user_id.to_string(),
        title: case_title(&task.title, &summary),
        case_summary: summary,
        risk_level: RiskLevel::Medium,
        created_at: task.updated_at,
        payload: task.payload.clone(),
        report,
        error: failure.map(str::to_string),
    }
}

/// Provided title, else the summary cut to 20 characters.
fn case_title(title: &str, summary: &str) -> String {
    let title = title.trim();
    if !title.is_empty() {
        return title.to_string();
    }
    let summary = summary.trim();
    if summary.is_empty() {
        return UNTITLED_CASE.to_string();
    }
    truncate_chars(summary, 20)
}

/// `TASK-` plus 12 upper-case hex digits, unused by any user.
fn unique_id(users: &BTreeMap<String, UserState>) -> String {
    let mut rng = rand::thread_rng();
    loop {
        let bytes: [u8; 6] = rng.gen();
        let hex: String = bytes.iter().map(|b| format!("{:02X}", b)).collect();
        let id = format!("TASK-{}", hex);

        let taken = users.values().any(|state| {
            state.pending.contains_key(&id) || state.history.iter().any(|h| h.record_id == id)
        });
        if !taken {
            return id;
        }
    }
}
