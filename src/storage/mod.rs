pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::job::{Job, JobId, JobState, JobSummary};

pub use sqlite::SqliteStorage;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job with ID '{0}' already exists")]
    DuplicateId(JobId),

    #[error("Job with ID '{0}' not found")]
    NotFound(JobId),

    #[error("Job '{id}' is in state '{state}', cannot move to '{target}'")]
    InvalidState {
        id: JobId,
        state: JobState,
        target: JobState,
    },

    #[error("Corrupt job row: {0}")]
    Corrupt(String),
}

impl StorageError {
    /// Another connection holds the write lock (SQLITE_BUSY / SQLITE_LOCKED).
    pub fn is_contention(&self) -> bool {
        let StorageError::Database(sqlx::Error::Database(db)) = self else {
            return false;
        };

        // Extended result codes keep the primary code in the low byte.
        db.code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, 5 | 6))
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// How a claimed job's execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed { exit_code: i32 },
}

impl From<crate::job::CommandResult> for Outcome {
    fn from(result: crate::job::CommandResult) -> Self {
        if result.success() {
            Outcome::Succeeded
        } else {
            Outcome::Failed {
                exit_code: result.exit_code,
            }
        }
    }
}

/// Durable job table.
///
/// Every state change goes through `claim_next`, `finalize` or `revive_dead`;
/// there is no way to set a job's state directly.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn insert(&self, job: Job) -> Result<JobId>;

    /// Atomically claim the oldest eligible job, or `None` when nothing is
    /// eligible or the store is busy.
    async fn claim_next(&self, backoff_base: u32, now: DateTime<Utc>) -> Result<Option<Job>>;

    /// Record the result of executing a claimed job.
    async fn finalize(&self, id: &JobId, outcome: Outcome) -> Result<Job>;

    /// Move a dead job back to pending with its attempts reset.
    async fn revive_dead(&self, id: &JobId) -> Result<Job>;

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>>;

    /// Jobs ordered oldest-created first.
    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>>;

    async fn summary(&self) -> Result<JobSummary>;
}
