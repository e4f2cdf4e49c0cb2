use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{ConfigError, ConfigProvider};
use crate::executor::{CommandExecutor, ShellExecutor};
use crate::job::{Job, JobId, JobState, JobSummary};
use crate::storage::{SqliteStorage, Storage, StorageError};
use crate::worker::Worker;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Invalid job: {0}")]
    Validation(String),

    #[error("Job with ID '{0}' already exists")]
    DuplicateId(JobId),

    #[error("Job with ID '{0}' not found")]
    NotFound(JobId),

    #[error("Job '{id}' is in state '{state}', not 'dead'")]
    InvalidState { id: JobId, state: JobState },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(StorageError),
}

impl From<StorageError> for QueueError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::DuplicateId(id) => QueueError::DuplicateId(id),
            StorageError::NotFound(id) => QueueError::NotFound(id),
            StorageError::InvalidState { id, state, .. } => QueueError::InvalidState { id, state },
            other => QueueError::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// A job submission, as accepted from callers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl EnqueueRequest {
    pub fn new<I: Into<String>, C: Into<String>>(id: I, command: C) -> Self {
        Self {
            id: Some(id.into()),
            command: Some(command.into()),
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Parse a JSON object such as `{"id": "job1", "command": "sleep 2"}`.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| QueueError::Validation(format!("invalid JSON: {e}")))
    }

    /// Id and command exactly as given, once both are known to be non-blank.
    fn required(&self) -> Result<(String, String)> {
        let field = |value: &Option<String>, name: &str| match value.as_deref() {
            Some(v) if !v.trim().is_empty() => Ok(v.to_string()),
            _ => Err(QueueError::Validation(format!("'{name}' is required"))),
        };

        let id = field(&self.id, "id")?;
        let command = field(&self.command, "command")?;

        if self.max_retries == Some(0) {
            return Err(QueueError::Validation("'max_retries' must be at least 1".into()));
        }

        Ok((id, command))
    }
}

/// Entry point for submitting, inspecting and working jobs
pub struct JobQueue {
    storage: Arc<dyn Storage>,
    config: Arc<dyn ConfigProvider>,
    executor: Arc<dyn CommandExecutor>,
    poll_interval: Duration,
    shutdown: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
}

impl JobQueue {
    /// Open (and migrate) the SQLite database at `connection_string`.
    pub async fn new(connection_string: &str) -> Result<Self> {
        let storage = Arc::new(SqliteStorage::new(connection_string).await?);
        Ok(Self::from_parts(storage.clone(), storage))
    }

    pub fn from_parts(storage: Arc<dyn Storage>, config: Arc<dyn ConfigProvider>) -> Self {
        Self {
            storage,
            config,
            executor: Arc::new(ShellExecutor::new()),
            poll_interval: Worker::DEFAULT_POLL_INTERVAL,
            shutdown: CancellationToken::new(),
            worker_handles: Vec::new(),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.storage)
    }

    /// Add a job in the `pending` state.
    ///
    /// `max_retries` defaults to the current configured value and is frozen
    /// on the job from then on.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<JobId> {
        let (id, command) = request.required()?;

        let max_retries = match request.max_retries {
            Some(max_retries) => max_retries,
            None => self.config.max_retries().await?,
        };

        let id = self.storage.insert(Job::new(id, command, max_retries)).await?;
        info!(job_id = %id, max_retries, "Job enqueued");
        Ok(id)
    }

    /// Jobs oldest-created first, optionally restricted to one state.
    pub async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        Ok(self.storage.list_jobs(state).await?)
    }

    pub async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.storage.get_job(id).await?)
    }

    /// Move a job out of the dead letter queue back to `pending`, resetting
    /// its attempts.
    pub async fn retry_from_dlq(&self, id: &JobId) -> Result<Job> {
        let job = self.storage.revive_dead(id).await?;
        info!(job_id = %job.id, "Job moved from DLQ to pending");
        Ok(job)
    }

    pub async fn summary(&self) -> Result<JobSummary> {
        Ok(self.storage.summary().await?)
    }

    pub async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.config.set(key, value).await?;
        info!(key, value, "Config updated");
        Ok(())
    }

    pub async fn get_config(&self, key: &str) -> Result<Option<String>> {
        Ok(self.config.get_or_default(key).await?)
    }

    pub async fn list_config(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.config.entries().await?)
    }

    /// Spawn `worker_count` worker loops on the current runtime.
    pub fn start(&mut self, worker_count: usize) {
        for _ in 0..worker_count {
            self.spawn_worker();
        }
    }

    fn spawn_worker(&mut self) {
        let worker = Worker::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.config),
            Arc::clone(&self.executor),
        )
        .with_poll_interval(self.poll_interval);

        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            worker.run(shutdown).await;
        });

        self.worker_handles.push(handle);
    }

    pub fn worker_count(&self) -> usize {
        self.worker_handles.len()
    }

    pub fn dashboard(&self) -> axum::Router {
        crate::dashboard::router(Arc::clone(&self.storage))
    }

    /// Token that stops every worker started by this queue when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Ask workers to stop and wait for their in-flight jobs to finish.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();

        for handle in self.worker_handles.drain(..) {
            let _ = handle.await;
        }

        info!("Shutdown complete");
    }

    /// Block until SIGINT or SIGTERM, then shut down gracefully.
    pub async fn wait_for_shutdown(&mut self) -> std::io::Result<()> {
        shutdown_signal().await?;
        info!("Shutdown requested, finishing in-flight jobs...");
        self.shutdown().await;
        Ok(())
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
