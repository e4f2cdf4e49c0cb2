use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ConfigProvider};
use crate::executor::CommandExecutor;
use crate::job::{CommandResult, Job, JobState};
use crate::storage::{Outcome, Storage, StorageError};

/// Busy finalize attempts logged as warnings before escalating to errors.
const FINALIZE_ATTEMPTS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Worker that claims, runs and finalizes jobs one at a time
pub struct Worker {
    id: String,
    storage: Arc<dyn Storage>,
    config: Arc<dyn ConfigProvider>,
    executor: Arc<dyn CommandExecutor>,
    poll_interval: Duration,
}

impl Worker {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

    pub fn new(
        storage: Arc<dyn Storage>,
        config: Arc<dyn ConfigProvider>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();

        Self {
            id: format!("worker-{}", &suffix[..8]),
            storage,
            config,
            executor,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set the poll interval for checking new jobs
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run the worker until shutdown is signaled.
    ///
    /// Shutdown is only observed between jobs: a claimed job is always
    /// executed and finalized before the loop exits.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker_id = %self.id, "Worker started");

        while !shutdown.is_cancelled() {
            match self.process_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to process next job");
                }
            }

            if shutdown.is_cancelled() {
                break;
            }

            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!(worker_id = %self.id, "Worker shutting down");
    }

    /// Claim one job, run it and record the outcome.
    ///
    /// Returns the finalized job, or `None` when nothing was claimable.
    pub async fn process_next(&self) -> Result<Option<Job>, WorkerError> {
        let Some(job) = self.claim().await? else {
            return Ok(None);
        };

        info!(
            worker_id = %self.id,
            job_id = %job.id,
            command = %job.command,
            attempts = job.attempts,
            "Picked up job"
        );

        let result = self.execute(&job).await;
        let finalized = self.finalize(&job, result).await?;

        match finalized.state {
            JobState::Completed => {
                info!(worker_id = %self.id, job_id = %finalized.id, "Job completed");
            }
            JobState::Failed => {
                warn!(
                    worker_id = %self.id,
                    job_id = %finalized.id,
                    exit_code = result.exit_code,
                    attempts = finalized.attempts,
                    max_retries = finalized.max_retries,
                    "Job failed, will retry"
                );
            }
            JobState::Dead => {
                warn!(
                    worker_id = %self.id,
                    job_id = %finalized.id,
                    exit_code = result.exit_code,
                    attempts = finalized.attempts,
                    max_retries = finalized.max_retries,
                    "Job moved to dead letter queue"
                );
            }
            state => {
                error!(worker_id = %self.id, job_id = %finalized.id, %state, "Unexpected state after finalize");
            }
        }

        Ok(Some(finalized))
    }

    async fn claim(&self) -> Result<Option<Job>, WorkerError> {
        // Read on every attempt so operators can retune backoff at runtime.
        let backoff_base = self.config.backoff_base().await?;
        let job = self.storage.claim_next(backoff_base, Utc::now()).await?;

        if job.is_none() {
            debug!(worker_id = %self.id, "No job available");
        }

        Ok(job)
    }

    /// Record the outcome. A busy store is retried until the write lands so
    /// the job does not stay in `processing`; any other error leaves it there
    /// and is reported.
    async fn finalize(&self, job: &Job, result: CommandResult) -> Result<Job, StorageError> {
        let mut attempt: u32 = 1;
        loop {
            match self.storage.finalize(&job.id, Outcome::from(result)).await {
                Ok(finalized) => return Ok(finalized),
                Err(e) if e.is_contention() => {
                    if attempt < FINALIZE_ATTEMPTS {
                        warn!(worker_id = %self.id, job_id = %job.id, attempt, "Store busy while finalizing job");
                    } else {
                        error!(
                            worker_id = %self.id,
                            job_id = %job.id,
                            attempt,
                            error = %e,
                            "Job stuck in processing, store still busy; retrying finalize"
                        );
                    }
                    attempt = attempt.saturating_add(1);
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => {
                    error!(
                        worker_id = %self.id,
                        job_id = %job.id,
                        exit_code = result.exit_code,
                        error = %e,
                        "Failed to finalize job, left in processing"
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Run the command on its own task so a panicking executor still
    /// produces an outcome for the job.
    async fn execute(&self, job: &Job) -> CommandResult {
        let executor = Arc::clone(&self.executor);
        let command = job.command.clone();

        match tokio::spawn(async move { executor.execute(&command).await }).await {
            Ok(result) => result,
            Err(e) => {
                error!(worker_id = %self.id, job_id = %job.id, error = %e, "Executor crashed");
                CommandResult::sentinel()
            }
        }
    }
}
