//! REST endpoints for job submission, status and session control.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::JobError;
use crate::jobs::{JobEngine, JobId, JobInput};

/// Shared state for the job routes.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<JobEngine>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({"error": message.into()}))).into_response()
}

fn job_error_response(err: JobError) -> Response {
    let status = match &err {
        JobError::NotFound { .. } => StatusCode::NOT_FOUND,
        JobError::Terminal { .. } | JobError::InvalidTransition { .. } => StatusCode::CONFLICT,
        JobError::QueueFull { .. } | JobError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    };
    error_response(status, err.to_string())
}

fn parse_job_id(raw: &str) -> Result<JobId, Response> {
    Uuid::parse_str(raw)
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, format!("Invalid job id '{raw}'")))
}

/// POST /jobs
///
/// Accepts the target parameters as a JSON object and returns immediately
/// with the new job id.
async fn submit_job(
    State(state): State<ApiState>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    if !body.is_object() {
        return error_response(StatusCode::BAD_REQUEST, "Job input must be a JSON object");
    }
    match state.engine.submit(JobInput::new(body)).await {
        Ok(ticket) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"jobId": ticket.id, "status": "pending"})),
        )
            .into_response(),
        Err(e) => job_error_response(e),
    }
}

/// GET /jobs/{id}
async fn get_job(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.engine.status(id).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => job_error_response(e),
    }
}

/// POST /jobs/{id}/cancel
///
/// Cooperative: the job stops at its next step boundary.
async fn cancel_job(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.engine.cancel(id).await {
        Ok(job) => Json(serde_json::json!({
            "jobId": job.id,
            "status": job.status,
            "cancelRequested": job.cancel_requested,
        }))
        .into_response(),
        Err(e) => job_error_response(e),
    }
}

/// POST /sessions/close
async fn close_session(State(state): State<ApiState>) -> impl IntoResponse {
    let outcome = state.engine.close_session().await;
    Json(serde_json::json!({"outcome": outcome}))
}

/// GET /status
async fn get_status(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.engine.health().await)
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// Build the job REST routes.
pub fn api_routes(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE]);

    Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/sessions/close", post(close_session))
        .route("/status", get(get_status))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state)
}
