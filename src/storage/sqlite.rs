use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::config::{self, ConfigProvider};
use crate::job::{Job, JobId, JobState, JobSummary};
use crate::retry::{self, RetryPolicy};

use super::{Outcome, Result, Storage, StorageError};

/// How long a connection waits on another writer's lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub type ExclusiveFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'c>>;

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Connect using a URL such as `sqlite://queue.db`. The file is created
    /// if it does not exist.
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?;
        Self::connect_with(options).await
    }

    /// Open the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new().filename(path);
        Self::connect_with(options).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self> {
        // Pragmas go on the connect options so every pooled connection gets them.
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run database migrations
    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                command TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_state_created ON jobs(state, created_at, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for (key, value) in config::DEFAULTS {
            sqlx::query("INSERT OR IGNORE INTO config (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(value)
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// The write lock is taken up front, so concurrent exclusive transactions
    /// from this or any other process queue behind it (up to the busy
    /// timeout) instead of interleaving. Commits when `f` succeeds and rolls
    /// back otherwise, including when this future is dropped mid-flight.
    pub async fn run_exclusive<T, F>(&self, f: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> ExclusiveFuture<'c, T> + Send,
    {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        match f(&mut *tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    debug!(error = %rollback, "Rollback of exclusive transaction failed");
                }
                Err(e)
            }
        }
    }
}

fn encode_ts(ts: DateTime<Utc>) -> String {
    // Fixed precision keeps lexical order equal to chronological order.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(column: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("{column} '{raw}': {e}")))
}

fn row_to_job(row: &SqliteRow) -> Result<Job> {
    let id: String = row.try_get("id")?;
    let command: String = row.try_get("command")?;
    let state_str: String = row.try_get("state")?;
    let attempts: i64 = row.try_get("attempts")?;
    let max_retries: i64 = row.try_get("max_retries")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    let state = state_str
        .parse::<JobState>()
        .map_err(|e| StorageError::Corrupt(format!("job '{id}': {e}")))?;

    let count = |column: &str, value: i64| {
        u32::try_from(value)
            .map_err(|_| StorageError::Corrupt(format!("job '{id}': {column} = {value}")))
    };

    Ok(Job {
        attempts: count("attempts", attempts)?,
        max_retries: count("max_retries", max_retries)?,
        created_at: decode_ts("created_at", &created_at)?,
        updated_at: decode_ts("updated_at", &updated_at)?,
        id: JobId(id),
        command,
        state,
    })
}

async fn fetch_job(conn: &mut SqliteConnection, id: &JobId) -> Result<Option<Job>> {
    let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
        .bind(&id.0)
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(row_to_job).transpose()
}

fn check_transition(job: &Job, target: JobState) -> Result<()> {
    if job.state.can_transition_to(target) {
        Ok(())
    } else {
        Err(StorageError::InvalidState {
            id: job.id.clone(),
            state: job.state,
            target,
        })
    }
}

async fn write_transition(
    conn: &mut SqliteConnection,
    job: &Job,
    target: JobState,
    attempts: u32,
    at: DateTime<Utc>,
) -> Result<Job> {
    check_transition(job, target)?;

    // The state guard makes a lost race visible even outside an exclusive
    // transaction.
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET state = ?, attempts = ?, updated_at = ?
        WHERE id = ? AND state = ?
        "#,
    )
    .bind(target.as_str())
    .bind(i64::from(attempts))
    .bind(encode_ts(at))
    .bind(&job.id.0)
    .bind(job.state.as_str())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() != 1 {
        return Err(StorageError::InvalidState {
            id: job.id.clone(),
            state: job.state,
            target,
        });
    }

    fetch_job(conn, &job.id)
        .await?
        .ok_or_else(|| StorageError::NotFound(job.id.clone()))
}

/// First claimable job in FIFO order: oldest `created_at`, then `id`.
async fn select_claimable(
    conn: &mut SqliteConnection,
    policy: RetryPolicy,
    now: DateTime<Utc>,
) -> Result<Option<Job>> {
    let pending = sqlx::query(
        r#"
        SELECT * FROM jobs
        WHERE state = 'pending'
        ORDER BY created_at ASC, id ASC
        LIMIT 1
        "#,
    )
    .fetch_optional(&mut *conn)
    .await?
    .as_ref()
    .map(row_to_job)
    .transpose()?;

    let failed_rows = sqlx::query(
        r#"
        SELECT * FROM jobs
        WHERE state = 'failed'
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    let mut retryable = None;
    for row in &failed_rows {
        let job = row_to_job(row)?;
        if policy.is_claimable(&job, now) {
            retryable = Some(job);
            break;
        }
    }

    let winner = match (pending, retryable) {
        (Some(p), Some(f)) => {
            if (f.created_at, &f.id) < (p.created_at, &p.id) {
                Some(f)
            } else {
                Some(p)
            }
        }
        (p, f) => p.or(f),
    };

    Ok(winner)
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn insert(&self, job: Job) -> Result<JobId> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, command, state, attempts, max_retries, created_at, updated_at)
            VALUES (?, ?, 'pending', 0, ?, ?, ?)
            "#,
        )
        .bind(&job.id.0)
        .bind(&job.command)
        .bind(i64::from(job.max_retries))
        .bind(encode_ts(job.created_at))
        .bind(encode_ts(job.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(job.id),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StorageError::DuplicateId(job.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn claim_next(&self, backoff_base: u32, now: DateTime<Utc>) -> Result<Option<Job>> {
        let policy = RetryPolicy::new(backoff_base);

        let claimed = self
            .run_exclusive(move |conn| {
                Box::pin(async move {
                    let Some(job) = select_claimable(&mut *conn, policy, now).await? else {
                        return Ok(None);
                    };

                    let attempts = job.attempts;
                    write_transition(conn, &job, JobState::Processing, attempts, now)
                        .await
                        .map(Some)
                })
            })
            .await;

        match claimed {
            Err(e) if e.is_contention() => {
                debug!(error = %e, "Store busy, skipping claim attempt");
                Ok(None)
            }
            other => other,
        }
    }

    async fn finalize(&self, id: &JobId, outcome: Outcome) -> Result<Job> {
        let id = id.clone();

        self.run_exclusive(move |conn| {
            Box::pin(async move {
                let job = fetch_job(&mut *conn, &id)
                    .await?
                    .ok_or_else(|| StorageError::NotFound(id.clone()))?;

                let (target, attempts) = match outcome {
                    Outcome::Succeeded => (JobState::Completed, job.attempts),
                    Outcome::Failed { .. } => {
                        let attempts = job.attempts.saturating_add(1);
                        (retry::decide(attempts, job.max_retries).state(), attempts)
                    }
                };

                write_transition(conn, &job, target, attempts, Utc::now()).await
            })
        })
        .await
    }

    async fn revive_dead(&self, id: &JobId) -> Result<Job> {
        let id = id.clone();

        self.run_exclusive(move |conn| {
            Box::pin(async move {
                let job = fetch_job(&mut *conn, &id)
                    .await?
                    .ok_or_else(|| StorageError::NotFound(id.clone()))?;

                write_transition(conn, &job, JobState::Pending, 0, Utc::now()).await
            })
        })
        .await
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        let mut conn = self.pool.acquire().await?;
        fetch_job(&mut *conn, id).await
    }

    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        let rows = match state {
            Some(state) => {
                sqlx::query(
                    r#"
                    SELECT * FROM jobs
                    WHERE state = ?
                    ORDER BY created_at ASC, id ASC
                    "#,
                )
                .bind(state.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM jobs ORDER BY created_at ASC, id ASC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(row_to_job).collect()
    }

    async fn summary(&self) -> Result<JobSummary> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS count FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut summary = JobSummary::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let count: i64 = row.try_get("count")?;
            let count = count.max(0) as u64;

            match state.parse::<JobState>() {
                Ok(state) => summary.add(state, count),
                Err(_) => {
                    warn!(state = %state, count, "Unknown job state in store");
                    summary.total += count;
                }
            }
        }

        Ok(summary)
    }
}

#[async_trait]
impl ConfigProvider for SqliteStorage {
    async fn get(&self, key: &str) -> config::Result<Option<String>> {
        let key = config::normalize_key(key);

        let value: Option<String> = sqlx::query_scalar("SELECT value FROM config WHERE key = ?")
            .bind(&key)
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::from)?;

        if value.is_some() {
            return Ok(value);
        }

        let Some(legacy) = config::legacy_key(&key) else {
            return Ok(None);
        };

        let legacy_value: Option<String> =
            sqlx::query_scalar("SELECT value FROM config WHERE key = ?")
                .bind(&legacy)
                .fetch_optional(&self.pool)
                .await
                .map_err(StorageError::from)?;

        if let Some(value) = &legacy_value {
            let (new_key, old_key, value) = (key.clone(), legacy.clone(), value.clone());
            let migrated = self
                .run_exclusive(move |conn| {
                    Box::pin(async move {
                        sqlx::query("INSERT OR REPLACE INTO config (key, value) VALUES (?, ?)")
                            .bind(&new_key)
                            .bind(&value)
                            .execute(&mut *conn)
                            .await?;
                        sqlx::query("DELETE FROM config WHERE key = ?")
                            .bind(&old_key)
                            .execute(&mut *conn)
                            .await?;
                        Ok(())
                    })
                })
                .await;

            if let Err(e) = migrated {
                warn!(key = %legacy, error = %e, "Failed to migrate legacy config key");
            }
        }

        Ok(legacy_value)
    }

    async fn set(&self, key: &str, value: &str) -> config::Result<()> {
        config::validate(key, value)?;
        let key = config::normalize_key(key);

        sqlx::query(
            r#"
            INSERT INTO config (key, value)
            VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(&key)
        .bind(value.trim())
        .execute(&self.pool)
        .await
        .map_err(StorageError::from)?;

        Ok(())
    }

    async fn entries(&self) -> config::Result<BTreeMap<String, String>> {
        let rows = sqlx::query("SELECT key, value FROM config")
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::from)?;

        let mut merged: BTreeMap<String, String> = config::DEFAULTS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let mut stored = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("key").map_err(StorageError::from)?;
            let value: String = row.try_get("value").map_err(StorageError::from)?;
            let normalized = config::normalize_key(&key);
            stored.push((key == normalized, normalized, value));
        }

        // Legacy spellings first so a canonical row wins on collision.
        stored.sort_by_key(|(canonical, _, _)| *canonical);
        for (_, key, value) in stored {
            merged.insert(key, value);
        }

        Ok(merged)
    }
}
