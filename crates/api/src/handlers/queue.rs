//! Queue API for workers (spec §6.3) — thin pass-throughs to `queue::ops`.
//! These endpoints mutate queue rows only; they never append events or
//! trigger broker evaluation themselves — that is the worker's job via
//! `POST /events`, and the broker's `on_action_error` handler performs its
//! own `queue::fail` call when reacting to an `action_error` event. This
//! endpoint exists for workers/tooling that manage queue state directly.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use db::models::QueueTaskRow;
use queue::RetryDecision;
use serde::Deserialize;
use serde_json::{json, Value};

use super::AppState;

fn queue_error_status(err: &queue::QueueError) -> StatusCode {
    match err {
        queue::QueueError::NotFound { .. } => StatusCode::NOT_FOUND,
        queue::QueueError::NotLeaseOwner { .. } => StatusCode::CONFLICT,
        queue::QueueError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Deserialize)]
pub struct LeaseRequestDto {
    pub worker_id: String,
    #[serde(default)]
    pub lease_seconds: Option<i64>,
}

pub async fn lease(
    State(state): State<AppState>,
    Json(payload): Json<LeaseRequestDto>,
) -> Result<Json<Option<QueueTaskRow>>, (StatusCode, Json<Value>)> {
    let lease_seconds = payload.lease_seconds.unwrap_or(state.lease_seconds);
    let task = queue::lease(&state.pool, &payload.worker_id, lease_seconds)
        .await
        .map_err(|e| (queue_error_status(&e), Json(json!({ "error": e.to_string() }))))?;
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
pub struct WorkerRequestDto {
    pub worker_id: String,
}

pub async fn complete(
    State(state): State<AppState>,
    Path(queue_id): Path<i64>,
    Json(payload): Json<WorkerRequestDto>,
) -> Result<Json<QueueTaskRow>, (StatusCode, Json<Value>)> {
    let task = queue::complete(&state.pool, queue_id, &payload.worker_id)
        .await
        .map_err(|e| (queue_error_status(&e), Json(json!({ "error": e.to_string() }))))?;
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
pub struct FailRequestDto {
    pub worker_id: String,
    pub error: String,
    pub decision: RetryDecision,
}

pub async fn fail(
    State(state): State<AppState>,
    Path(queue_id): Path<i64>,
    Json(payload): Json<FailRequestDto>,
) -> Result<Json<QueueTaskRow>, (StatusCode, Json<Value>)> {
    let task = queue::fail(&state.pool, queue_id, &payload.worker_id, &payload.error, payload.decision)
        .await
        .map_err(|e| (queue_error_status(&e), Json(json!({ "error": e.to_string() }))))?;
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequestDto {
    pub worker_id: String,
    #[serde(default)]
    pub lease_seconds: Option<i64>,
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(queue_id): Path<i64>,
    Json(payload): Json<HeartbeatRequestDto>,
) -> Result<Json<QueueTaskRow>, (StatusCode, Json<Value>)> {
    let lease_seconds = payload.lease_seconds.unwrap_or(state.lease_seconds);
    let task = queue::heartbeat(&state.pool, queue_id, &payload.worker_id, lease_seconds)
        .await
        .map_err(|e| (queue_error_status(&e), Json(json!({ "error": e.to_string() }))))?;
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
pub struct ListQueueQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub execution_id: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQueueQuery>,
) -> Result<Json<Vec<QueueTaskRow>>, (StatusCode, Json<Value>)> {
    let limit = query.limit.unwrap_or(100);
    let tasks = queue::list(&state.pool, query.status.as_deref(), query.execution_id, limit)
        .await
        .map_err(|e| (queue_error_status(&e), Json(json!({ "error": e.to_string() }))))?;
    Ok(Json(tasks))
}
