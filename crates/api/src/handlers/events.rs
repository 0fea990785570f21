//! `POST /events` and `GET /events` (spec §6.2).

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use db::repository::events::NewEvent;
use db::models::EventRow;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct AppendEventDto {
    pub execution_id: i64,
    pub event_type: String,
    #[serde(default)]
    pub catalog_id: Option<i64>,
    #[serde(default)]
    pub parent_event_id: Option<i64>,
    #[serde(default)]
    pub parent_execution_id: Option<i64>,
    #[serde(default)]
    pub parent_step: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub attempt: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct AppendEventResponseDto {
    pub event_id: i64,
    pub execution_id: i64,
    pub event_type: String,
}

/// Appends the event, then kicks off broker re-evaluation without waiting
/// on it — spec §6.2's "triggers a broker evaluation asynchronously".
pub async fn append(
    State(state): State<AppState>,
    Json(payload): Json<AppendEventDto>,
) -> Result<(StatusCode, Json<AppendEventResponseDto>), (StatusCode, Json<Value>)> {
    let catalog_id = match payload.catalog_id {
        Some(id) => id,
        None => {
            let events = db::repository::events::stream(&state.pool, payload.execution_id)
                .await
                .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))))?;
            match events.first() {
                Some(e) => e.catalog_id,
                None => {
                    return Err((
                        StatusCode::NOT_FOUND,
                        Json(json!({ "error": "unknown execution_id" })),
                    ))
                }
            }
        }
    };

    let event_type = payload.event_type.clone();
    let execution_id = payload.execution_id;

    let row = db::repository::events::append(
        &state.pool,
        state.broker.ids(),
        NewEvent {
            execution_id,
            catalog_id,
            parent_event_id: payload.parent_event_id,
            parent_execution_id: payload.parent_execution_id,
            parent_step: payload.parent_step,
            event_type: event_type.clone(),
            status: payload.status.unwrap_or_else(|| "ok".to_string()),
            node_id: payload.node_id,
            node_name: payload.node_name,
            node_type: payload.node_type,
            context: payload.context,
            result: payload.result,
            meta: payload.metadata,
            worker_id: payload.worker_id,
            attempt: payload.attempt,
        },
    )
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))))?;

    let broker = state.broker.clone();
    tokio::spawn(async move {
        if let Err(err) = broker.evaluate_execution(execution_id, &event_type).await {
            tracing::warn!(execution_id, %err, "broker evaluation after event append failed");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(AppendEventResponseDto {
            event_id: row.event_id,
            execution_id: row.execution_id,
            event_type: row.event_type,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    pub execution_id: i64,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListEventsQuery>,
) -> Result<Json<Vec<EventRow>>, (StatusCode, Json<Value>)> {
    let events = match query.event_type {
        Some(ty) => {
            db::repository::events::by_types(&state.pool, query.execution_id, &[ty.as_str()]).await
        }
        None => db::repository::events::stream(&state.pool, query.execution_id).await,
    }
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))))?;

    Ok(Json(events))
}
