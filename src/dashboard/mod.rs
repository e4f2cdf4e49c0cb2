mod templates;

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Router,
};
use tracing::{error, warn};

use crate::job::{JobId, JobState};
use crate::storage::{Storage, StorageError};

#[derive(Clone)]
struct DashboardState {
    storage: Arc<dyn Storage>,
}

pub fn router(storage: Arc<dyn Storage>) -> Router {
    let state = DashboardState { storage };

    Router::new()
        .route("/", get(overview))
        .route("/jobs/{state}", get(jobs_by_state))
        .route("/jobs/{id}/retry", post(retry_job))
        .with_state(state)
}

async fn overview(State(state): State<DashboardState>) -> Response {
    match state.storage.summary().await {
        Ok(summary) => Html(templates::render_overview(&summary)).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn jobs_by_state(State(state): State<DashboardState>, Path(job_state): Path<String>) -> Response {
    let Ok(job_state) = job_state.parse::<JobState>() else {
        return (StatusCode::NOT_FOUND, Html(templates::render_message("Unknown state"))).into_response();
    };

    match state.storage.list_jobs(Some(job_state)).await {
        Ok(jobs) => Html(templates::render_jobs(job_state, &jobs)).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn retry_job(State(state): State<DashboardState>, Path(id): Path<String>) -> Response {
    match state.storage.revive_dead(&JobId(id)).await {
        Ok(_) => Redirect::to("/jobs/dead").into_response(),
        Err(e @ StorageError::NotFound(_)) => rejected(StatusCode::NOT_FOUND, e),
        Err(e @ StorageError::InvalidState { .. }) => rejected(StatusCode::CONFLICT, e),
        Err(e) => internal_error(e),
    }
}

fn rejected(status: StatusCode, e: StorageError) -> Response {
    warn!(error = %e, "Rejected DLQ retry from dashboard");
    (status, Html(templates::render_message(&e.to_string()))).into_response()
}

fn internal_error(e: StorageError) -> Response {
    error!(error = %e, "Dashboard query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(templates::render_message("Storage error")),
    )
        .into_response()
}
