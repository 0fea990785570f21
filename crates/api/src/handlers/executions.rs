//! `POST /executions/run` and its `/execute` alias (spec §6.1).

use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use engine::PlaybookRef;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{engine_error_status, AppState};

/// Accepts any of the three identifier strategies and any of the three
/// parameter-mapping aliases spec §6.1 names for backward compatibility.
#[derive(Debug, Deserialize)]
pub struct RunRequestDto {
    #[serde(default)]
    pub catalog_id: Option<i64>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub args: Option<Value>,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub input_payload: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct RunResponseDto {
    pub execution_id: i64,
    pub id: i64,
    pub status: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub execution_type: &'static str,
    pub timestamp: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

pub async fn run(
    State(state): State<AppState>,
    Json(payload): Json<RunRequestDto>,
) -> Result<(StatusCode, Json<RunResponseDto>), (StatusCode, Json<Value>)> {
    let playbook_ref = PlaybookRef {
        catalog_id: payload.catalog_id,
        path: payload.path.clone(),
        version: payload.version.clone(),
    };
    let workload = payload
        .args
        .or(payload.parameters)
        .or(payload.input_payload)
        .unwrap_or_else(|| json!({}));

    let execution_id = state
        .broker
        .submit(&playbook_ref, workload, None)
        .await
        .map_err(|e| (engine_error_status(&e), Json(json!({ "error": e.to_string() }))))?;

    let now = Utc::now();
    Ok((
        StatusCode::ACCEPTED,
        Json(RunResponseDto {
            execution_id,
            id: execution_id,
            status: "running",
            kind: "playbook",
            execution_type: "playbook",
            timestamp: now,
            start_time: now,
            path: payload.path,
            version: payload.version,
        }),
    ))
}
