//! Task submission and background execution.
//!
//! Submissions go through one bounded queue consumed by a fixed pool of
//! workers. Enqueueing never blocks: a full queue fails the task at once.

use crate::analysis::media;
use crate::config::QueueConfig;
use crate::error::SubmitError;
use crate::models::{Modality, TaskPayload, TaskStatus};
use crate::pipeline::CaseProcessor;
use crate::store::TaskStore;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Failure reason recorded when the queue rejects a task.
pub const QUEUE_FULL_MESSAGE: &str = "task queue is full, please retry later";

/// What a caller submits: text plus base64 media.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmissionRequest {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub audios: Vec<String>,
    #[serde(default)]
    pub videos: Vec<String>,
}

impl SubmissionRequest {
    /// Validate and normalize into a task payload.
    ///
    /// Blank media entries are dropped; every other entry must be base64
    /// or a base64 data URL.
    pub fn into_payload(self) -> Result<TaskPayload, SubmitError> {
        let images = validate_media(Modality::Image, self.images)?;
        let audios = validate_media(Modality::Audio, self.audios)?;
        let videos = validate_media(Modality::Video, self.videos)?;

        let payload = TaskPayload {
            text: self.text.trim().to_string(),
            images,
            audios,
            videos,
            ..Default::default()
        };

        if payload.is_empty() {
            return Err(SubmitError::EmptySubmission);
        }
        Ok(payload)
    }
}

fn validate_media(modality: Modality, items: Vec<String>) -> Result<Vec<String>, SubmitError> {
    let items: Vec<String> = items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    for (i, item) in items.iter().enumerate() {
        media::decode(item).map_err(|source| SubmitError::InvalidMedia {
            modality,
            index: i + 1,
            source,
        })?;
    }
    Ok(items)
}

/// Response to an accepted submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionReceipt {
    pub task_id: String,
    pub status: TaskStatus,
    pub message: String,
}

#[derive(Debug)]
struct Job {
    user_id: String,
    task_id: String,
}

/// Queue plus worker pool driving task state in the store.
pub struct TaskScheduler {
    store: Arc<TaskStore>,
    sender: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskScheduler {
    /// Spawn the workers. Must be called inside a Tokio runtime.
    pub fn start(
        store: Arc<TaskStore>,
        processor: Arc<dyn CaseProcessor>,
        config: &QueueConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..config.workers.max(1))
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    Arc::clone(&receiver),
                    Arc::clone(&store),
                    Arc::clone(&processor),
                ))
            })
            .collect();

        info!(
            "Scheduler started with {} workers, queue capacity {}",
            config.workers.max(1),
            config.capacity.max(1)
        );

        Self {
            store,
            sender,
            workers,
        }
    }

    /// Validate, create and enqueue a task for `user_id`.
    pub fn submit(
        &self,
        user_id: &str,
        request: SubmissionRequest,
    ) -> Result<SubmissionReceipt, SubmitError> {
        let payload = request.into_payload()?;
        let task = self.store.create_task(user_id, payload);

        self.enqueue(Job {
            user_id: task.user_id.clone(),
            task_id: task.task_id.clone(),
        })?;

        Ok(SubmissionReceipt {
            task_id: task.task_id,
            status: TaskStatus::Pending,
            message: "task accepted".to_string(),
        })
    }

    fn enqueue(&self, job: Job) -> Result<(), SubmitError> {
        match self.sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!("Queue full, failing task {}", job.task_id);
                self.store
                    .mark_task_failed(&job.user_id, &job.task_id, QUEUE_FULL_MESSAGE);
                Err(SubmitError::QueueFull {
                    task_id: job.task_id,
                })
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                self.store
                    .mark_task_failed(&job.user_id, &job.task_id, "scheduler is shut down");
                Err(SubmitError::Closed)
            }
        }
    }

    /// Re-enqueue tasks a previous process left pending or processing.
    ///
    /// Waits for queue space instead of failing recovered tasks.
    pub async fn recover_pending(&self) -> usize {
        let tasks = self.store.pending_tasks();
        let mut recovered = 0;

        for task in tasks {
            let job = Job {
                user_id: task.user_id,
                task_id: task.task_id,
            };
            debug!("Recovering task {}", job.task_id);
            if self.sender.send(job).await.is_err() {
                error!("Queue closed while recovering tasks");
                break;
            }
            recovered += 1;
        }

        if recovered > 0 {
            info!("Recovered {} unfinished tasks", recovered);
        }
        recovered
    }

    /// Close the queue, let the workers drain it and wait for them.
    pub async fn shutdown(self) {
        let Self {
            sender, workers, ..
        } = self;
        drop(sender);

        for handle in workers {
            if let Err(e) = handle.await {
                error!("Worker terminated abnormally: {}", e);
            }
        }
        info!("Scheduler stopped");
    }
}

async fn worker_loop(
    id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    store: Arc<TaskStore>,
    processor: Arc<dyn CaseProcessor>,
) {
    debug!("Worker {} started", id);
    loop {
        let job = receiver.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };
        run_job(id, &store, processor.as_ref(), job).await;
    }
    debug!("Worker {} stopped", id);
}

async fn run_job(worker: usize, store: &TaskStore, processor: &dyn CaseProcessor, job: Job) {
    store.mark_task_processing(&job.user_id, &job.task_id);
    let Some(task) = store.get_task(&job.user_id, &job.task_id) else {
        warn!("Task {} is no longer pending, skipping", job.task_id);
        return;
    };

    info!("Worker {} processing task {}", worker, task.task_id);
    match AssertUnwindSafe(processor.process(&task)).catch_unwind().await {
        Ok(Ok(report)) => {
            store.mark_task_completed(&job.user_id, &job.task_id, &report);
            info!("Task {} completed", job.task_id);
        }
        Ok(Err(e)) => {
            error!("Task {} failed: {:#}", job.task_id, e);
            store.mark_task_failed(&job.user_id, &job.task_id, &format!("{:#}", e));
        }
        Err(_) => {
            error!("Task {} panicked during processing", job.task_id);
            store.mark_task_failed(&job.user_id, &job.task_id, "task processing panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tools::{
        QUERY_USER_INFO, SEARCH_SIMILAR_CASES, SUBMIT_FINAL_REPORT, WRITE_USER_HISTORY_CASE,
    };
    use crate::analysis::analyzer::ANALYSIS_TOOL_NAME;
    use crate::config::Config;
    use crate::llm::mock::{tool_reply, ScriptedEndpoint};
    use crate::models::TaskRecord;
    use crate::pipeline::CasePipeline;
    use crate::profile::{ProfileStore, StaticProfiles};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    /// Signals when it starts and waits for a permit before finishing.
    struct Gated {
        started: mpsc::UnboundedSender<String>,
        release: Arc<Semaphore>,
    }

    #[async_trait]
    impl CaseProcessor for Gated {
        async fn process(&self, task: &TaskRecord) -> Result<String> {
            let _ = self.started.send(task.task_id.clone());
            self.release.acquire().await?.forget();
            if task.payload.text == "explode" {
                return Err(anyhow!("model unavailable"));
            }
            if task.payload.text == "panic" {
                panic!("processor bug");
            }
            Ok(format!("report for {}", task.payload.text))
        }
    }

    fn temp_store() -> (TempDir, Arc<TaskStore>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TaskStore::open(dir.path().join("state.json")));
        (dir, store)
    }

    fn gated(store: &Arc<TaskStore>, capacity: usize) -> (TaskScheduler, mpsc::UnboundedReceiver<String>, Arc<Semaphore>) {
        let (started, started_rx) = mpsc::unbounded_channel();
        let release = Arc::new(Semaphore::new(0));
        let processor = Arc::new(Gated {
            started,
            release: Arc::clone(&release),
        });
        let config = QueueConfig {
            capacity,
            workers: 1,
        };
        let scheduler = TaskScheduler::start(Arc::clone(store), processor, &config);
        (scheduler, started_rx, release)
    }

    fn text(text: &str) -> SubmissionRequest {
        SubmissionRequest {
            text: text.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            SubmissionRequest::default().into_payload(),
            Err(SubmitError::EmptySubmission)
        ));
        assert!(matches!(
            SubmissionRequest {
                text: "   ".to_string(),
                images: vec![" ".to_string()],
                ..Default::default()
            }
            .into_payload(),
            Err(SubmitError::EmptySubmission)
        ));

        let err = SubmissionRequest {
            audios: vec!["AAAA".to_string(), "@@@".to_string()],
            ..Default::default()
        }
        .into_payload()
        .unwrap_err();
        assert!(matches!(
            err,
            SubmitError::InvalidMedia {
                modality: Modality::Audio,
                index: 2,
                ..
            }
        ));

        let payload = SubmissionRequest {
            text: " hi ".to_string(),
            images: vec!["data:image/png;base64,AAAA".to_string(), "".to_string()],
            ..Default::default()
        }
        .into_payload()
        .unwrap();
        assert_eq!(payload.text, "hi");
        assert_eq!(payload.images.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_submission_creates_no_task() {
        let (_dir, store) = temp_store();
        let (scheduler, _started, _release) = gated(&store, 4);

        assert!(scheduler.submit("u1", SubmissionRequest::default()).is_err());
        assert!(store.list_tasks("u1").is_empty());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_queue_fails_task_immediately() {
        let (_dir, store) = temp_store();
        let (scheduler, mut started, release) = gated(&store, 1);

        let a = scheduler.submit("u1", text("a")).unwrap();
        assert_eq!(a.status, TaskStatus::Pending);
        assert_eq!(started.recv().await.unwrap(), a.task_id);

        let b = scheduler.submit("u1", text("b")).unwrap();
        let c = scheduler.submit("u1", text("c")).unwrap_err();
        let SubmitError::QueueFull { task_id: c_id } = c else {
            panic!("expected queue full");
        };

        let detail = store.get_task_detail_by_id("u1", &c_id).unwrap();
        assert_eq!(detail.status, TaskStatus::Failed);
        assert_eq!(detail.error, QUEUE_FULL_MESSAGE);

        release.add_permits(2);
        scheduler.shutdown().await;

        for (id, body) in [(&a.task_id, "a"), (&b.task_id, "b")] {
            let detail = store.get_task_detail_by_id("u1", id).unwrap();
            assert_eq!(detail.status, TaskStatus::Completed);
            assert_eq!(detail.report, format!("report for {}", body));
            assert!(detail.error.is_empty());
        }
        assert!(store.get_user_state_view("u1").pending.is_empty());
    }

    #[tokio::test]
    async fn test_processing_failures_are_recorded() {
        let (_dir, store) = temp_store();
        let (scheduler, mut started, release) = gated(&store, 4);
        release.add_permits(2);

        let failed = scheduler.submit("u1", text("explode")).unwrap();
        started.recv().await.unwrap();
        let panicked = scheduler.submit("u1", text("panic")).unwrap();
        scheduler.shutdown().await;

        let detail = store.get_task_detail_by_id("u1", &failed.task_id).unwrap();
        assert_eq!(detail.status, TaskStatus::Failed);
        assert!(detail.error.contains("model unavailable"));
        assert!(detail.report.is_empty());

        let detail = store.get_task_detail_by_id("u1", &panicked.task_id).unwrap();
        assert_eq!(detail.status, TaskStatus::Failed);
        assert_eq!(detail.error, "task processing panicked");
    }

    #[tokio::test]
    async fn test_worker_marks_processing() {
        let (_dir, store) = temp_store();
        let (scheduler, mut started, release) = gated(&store, 4);

        let receipt = scheduler.submit("u1", text("a")).unwrap();
        started.recv().await.unwrap();
        assert_eq!(
            store.get_task("u1", &receipt.task_id).unwrap().status,
            TaskStatus::Processing
        );

        release.add_permits(1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_recover_pending_tasks() {
        let (_dir, store) = temp_store();
        let first = store.create_task("u1", TaskPayload {
            text: "left behind".to_string(),
            ..Default::default()
        });
        let second = store.create_task("u2", TaskPayload {
            text: "also left".to_string(),
            ..Default::default()
        });
        store.mark_task_processing("u2", &second.task_id);

        let (scheduler, _started, release) = gated(&store, 1);
        release.add_permits(2);
        assert_eq!(scheduler.recover_pending().await, 2);
        scheduler.shutdown().await;

        assert!(store.pending_tasks().is_empty());
        assert_eq!(
            store.get_task_detail_by_id("u1", &first.task_id).unwrap().status,
            TaskStatus::Completed
        );
        assert_eq!(
            store.get_task_detail_by_id("u2", &second.task_id).unwrap().report,
            "report for also left"
        );
    }

    #[tokio::test]
    async fn test_end_to_end_image_case() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TaskStore::open(dir.path().join("state.json")));

        let mut config = Config::default();
        config.model.main_model = "main".to_string();
        config.model.image_model = "vision".to_string();
        config.retry.base_delay_ms = 1;

        let endpoint = Arc::new(ScriptedEndpoint::new());
        endpoint
            .push(
                "vision",
                tool_reply(
                    "a",
                    ANALYSIS_TOOL_NAME,
                    json!({"scene_judgment": "photo", "key_content": "bank logo", "suspicious_points": ["blurred URL"]}),
                ),
            )
            .push("main", tool_reply("s", SEARCH_SIMILAR_CASES, json!({"query": "bank logo"})))
            .push(
                "main",
                tool_reply(
                    "r",
                    SUBMIT_FINAL_REPORT,
                    json!({"summary": "Possible bank impersonation", "risk_level": "medium"}),
                ),
            )
            .push(
                "main",
                tool_reply(
                    "w",
                    WRITE_USER_HISTORY_CASE,
                    json!({"title": "Bank logo", "case_summary": "impersonation", "risk_level": "medium"}),
                ),
            );

        let profiles: Arc<dyn ProfileStore> = Arc::new(StaticProfiles::default());
        let pipeline = Arc::new(CasePipeline::from_config(
            &config,
            endpoint,
            Arc::clone(&store),
            profiles,
        ));
        let scheduler = TaskScheduler::start(Arc::clone(&store), pipeline, &config.queue);

        let img1 = "iVBORw0KGgoAAAA=".to_string();
        let receipt = scheduler
            .submit(
                "u1",
                SubmissionRequest {
                    text: "test".to_string(),
                    images: vec![img1.clone()],
                    ..Default::default()
                },
            )
            .unwrap();
        scheduler.shutdown().await;

        let detail = store.get_task_detail_by_id("u1", &receipt.task_id).unwrap();
        assert_eq!(detail.status, TaskStatus::Completed);
        assert!(detail.report.contains("Possible bank impersonation"));
        assert!(detail.error.is_empty());

        let history = store.get_case_history("u1");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].record_id, receipt.task_id);
        assert_eq!(history[0].payload.images, vec![img1]);
        assert_eq!(history[0].payload.image_insights.len(), 1);
        assert!(store.get_user_state_view("u1").pending.is_empty());
    }

    #[tokio::test]
    async fn test_round_budget_exhaustion_fails_task() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TaskStore::open(dir.path().join("state.json")));

        let mut config = Config::default();
        config.model.main_model = "main".to_string();
        config.retry.base_delay_ms = 1;
        assert_eq!(config.agent.max_rounds, 8);

        let endpoint = Arc::new(ScriptedEndpoint::new());
        endpoint.always("main", tool_reply("i", QUERY_USER_INFO, json!({})));

        let profiles: Arc<dyn ProfileStore> = Arc::new(StaticProfiles::default());
        let pipeline = Arc::new(CasePipeline::from_config(
            &config,
            endpoint.clone(),
            Arc::clone(&store),
            profiles,
        ));
        let scheduler = TaskScheduler::start(Arc::clone(&store), pipeline, &config.queue);

        let receipt = scheduler.submit("u1", text("endless lookups")).unwrap();
        scheduler.shutdown().await;

        assert_eq!(endpoint.requests_for("main").len(), 8);

        let detail = store.get_task_detail_by_id("u1", &receipt.task_id).unwrap();
        assert_eq!(detail.status, TaskStatus::Failed);
        assert!(detail.error.contains("8 rounds"), "{}", detail.error);
        assert!(detail.report.is_empty());

        let history = store.get_case_history("u1");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].record_id, receipt.task_id);
        assert_eq!(history[0].payload.text, "endless lookups");
        assert!(history[0].error.as_deref().unwrap_or_default().contains("8 rounds"));
        assert!(store.get_user_state_view("u1").pending.is_empty());
    }
}
