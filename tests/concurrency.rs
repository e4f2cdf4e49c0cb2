use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use queuectl::{
    CommandExecutor, CommandResult, EnqueueRequest, Job, JobId, JobQueue, JobState, SqliteStorage, Storage,
    StorageError,
};

/// Records every command it runs and succeeds after an optional delay.
#[derive(Default)]
struct Recording {
    delay: Duration,
    runs: Mutex<HashMap<String, u32>>,
}

impl Recording {
    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn runs(&self) -> HashMap<String, u32> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandExecutor for Recording {
    async fn execute(&self, command: &str) -> CommandResult {
        *self.runs.lock().unwrap().entry(command.to_string()).or_default() += 1;
        tokio::time::sleep(self.delay).await;
        CommandResult::new(0)
    }
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(20), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn separate_connections_never_claim_the_same_job() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");

    let first = SqliteStorage::open(&path).await.unwrap();
    let second = SqliteStorage::open(&path).await.unwrap();
    first.insert(Job::new("j3", "sleep 1", 3)).await.unwrap();

    let now = Utc::now();
    let (a, b) = tokio::join!(first.claim_next(2, now), second.claim_next(2, now));
    let claimed: Vec<_> = [a.unwrap(), b.unwrap()].into_iter().flatten().collect();

    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, JobId::from("j3"));
    assert_eq!(claimed[0].state, JobState::Processing);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abandoned_exclusive_transaction_releases_the_write_lock() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");

    let first = SqliteStorage::open(&path).await.unwrap();
    let second = SqliteStorage::open(&path).await.unwrap();
    first.insert(Job::new("j1", "true", 3)).await.unwrap();
    first.insert(Job::new("j2", "true", 3)).await.unwrap();

    let stalled = first.run_exclusive::<(), _>(|_conn| {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<(), StorageError>(())
        })
    });
    assert!(tokio::time::timeout(Duration::from_millis(200), stalled)
        .await
        .is_err());

    let started = Instant::now();
    let claimed = second.claim_next(2, Utc::now()).await.unwrap().unwrap();
    assert_eq!(claimed.id, JobId::from("j1"));
    assert!(started.elapsed() < Duration::from_secs(4), "{:?}", started.elapsed());

    // The pool that abandoned the transaction keeps working as well.
    let claimed = first.claim_next(2, Utc::now()).await.unwrap().unwrap();
    assert_eq!(claimed.id, JobId::from("j2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_workers_run_each_job_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(SqliteStorage::open(dir.path().join("queue.db")).await.unwrap());
    let executor = Arc::new(Recording::slow(Duration::from_millis(5)));

    let mut queue = JobQueue::from_parts(storage.clone(), storage.clone())
        .with_executor(executor.clone())
        .with_poll_interval(Duration::from_millis(10));

    for i in 0..20 {
        queue
            .enqueue(EnqueueRequest::new(format!("job-{i}"), format!("echo {i}")))
            .await
            .unwrap();
    }

    queue.start(4);
    assert_eq!(queue.worker_count(), 4);

    wait_until(|| {
        let storage = storage.clone();
        async move { storage.summary().await.unwrap().completed == 20 }
    })
    .await;
    queue.shutdown().await;

    let runs = executor.runs();
    assert_eq!(runs.len(), 20);
    assert!(runs.values().all(|&n| n == 1), "{runs:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_lets_in_flight_job_finish() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(SqliteStorage::open(dir.path().join("queue.db")).await.unwrap());
    let executor = Arc::new(Recording::slow(Duration::from_millis(750)));

    let mut queue = JobQueue::from_parts(storage.clone(), storage.clone())
        .with_executor(executor.clone())
        .with_poll_interval(Duration::from_millis(10));
    queue.enqueue(EnqueueRequest::new("slow", "sleep 1")).await.unwrap();
    queue.enqueue(EnqueueRequest::new("next", "echo next")).await.unwrap();

    queue.start(1);
    wait_until(|| {
        let storage = storage.clone();
        async move {
            let job = storage.get_job(&"slow".into()).await.unwrap().unwrap();
            job.state == JobState::Processing
        }
    })
    .await;

    queue.shutdown().await;

    let slow = storage.get_job(&"slow".into()).await.unwrap().unwrap();
    assert_eq!(slow.state, JobState::Completed);

    // The worker stopped before picking up anything else.
    let next = storage.get_job(&"next".into()).await.unwrap().unwrap();
    assert_eq!(next.state, JobState::Pending);
    assert_eq!(queue.worker_count(), 0);
}

#[tokio::test]
async fn idle_workers_stop_promptly() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(SqliteStorage::open(dir.path().join("queue.db")).await.unwrap());

    let mut queue = JobQueue::from_parts(storage.clone(), storage)
        .with_executor(Arc::new(Recording::default()))
        .with_poll_interval(Duration::from_secs(60));
    queue.start(2);

    // A worker sleeping out a long poll interval must still react to shutdown.
    tokio::time::timeout(Duration::from_secs(5), queue.shutdown())
        .await
        .expect("workers did not stop");
}
