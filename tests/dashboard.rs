use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use chrono::Utc;
use queuectl::{EnqueueRequest, JobId, JobQueue, JobState, Outcome, SqliteStorage, Storage};
use tower::ServiceExt;

async fn queue_with_dead_job() -> (tempfile::TempDir, Arc<SqliteStorage>, JobQueue) {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(SqliteStorage::open(dir.path().join("queue.db")).await.unwrap());
    let queue = JobQueue::from_parts(storage.clone(), storage.clone());

    queue
        .enqueue(EnqueueRequest::new("broken", "exit 1").with_max_retries(1))
        .await
        .unwrap();
    queue.enqueue(EnqueueRequest::new("waiting", "true")).await.unwrap();

    let job = storage.claim_next(2, Utc::now()).await.unwrap().unwrap();
    storage
        .finalize(&job.id, Outcome::Failed { exit_code: 1 })
        .await
        .unwrap();

    (dir, storage, queue)
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn overview_renders_counts() {
    let (_dir, _storage, queue) = queue_with_dead_job().await;

    let response = queue
        .dashboard()
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let html = body_text(response).await;
    assert!(html.contains("<h3>1</h3><p>dead</p>"));
    assert!(html.contains("<h3>1</h3><p>pending</p>"));
    assert!(html.contains("<h3>2</h3><p>total</p>"));
}

#[tokio::test]
async fn state_listing_and_unknown_state() {
    let (_dir, _storage, queue) = queue_with_dead_job().await;

    let response = queue
        .dashboard()
        .oneshot(Request::get("/jobs/dead").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let html = body_text(response).await;
    assert!(html.contains("broken"));
    assert!(!html.contains("waiting"));
    assert!(html.contains("/jobs/broken/retry"));

    let response = queue
        .dashboard()
        .oneshot(Request::get("/jobs/enqueued").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn retry_button_revives_dead_job() {
    let (_dir, storage, queue) = queue_with_dead_job().await;

    let response = queue
        .dashboard()
        .oneshot(Request::post("/jobs/broken/retry").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(response.headers()[header::LOCATION], "/jobs/dead");

    let job = storage.get_job(&JobId::from("broken")).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
}

#[tokio::test]
async fn retry_of_live_job_conflicts() {
    let (_dir, storage, queue) = queue_with_dead_job().await;

    let response = queue
        .dashboard()
        .oneshot(Request::post("/jobs/waiting/retry").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let job = storage.get_job(&JobId::from("waiting")).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
}

#[tokio::test]
async fn retry_of_unknown_job_is_not_found() {
    let (_dir, storage, queue) = queue_with_dead_job().await;

    let response = queue
        .dashboard()
        .oneshot(Request::post("/jobs/nope/retry").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(body_text(response).await.contains("not found"));

    assert!(storage.get_job(&JobId::from("nope")).await.unwrap().is_none());
    assert_eq!(storage.summary().await.unwrap().dead, 1);
}
