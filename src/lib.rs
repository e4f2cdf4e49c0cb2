pub mod cli;
pub mod config;
mod dashboard;
pub mod executor;
mod job;
mod jobqueue;
pub mod retry;
pub mod storage;
mod worker;

pub use config::{ConfigError, ConfigProvider, StaticConfig};
pub use executor::{CommandExecutor, ShellExecutor};
pub use job::{CommandResult, Job, JobId, JobState, JobSummary, ParseJobStateError};
pub use jobqueue::{EnqueueRequest, JobQueue, QueueError};
pub use storage::{Outcome, SqliteStorage, Storage, StorageError};
pub use worker::{Worker, WorkerError};
