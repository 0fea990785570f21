//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models — they carry no domain behaviour.
//! Domain types (Playbook, Step, TransitionRule, …) live in the `engine`
//! crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// noetl.catalog
// ---------------------------------------------------------------------------

/// A registered playbook document, keyed by (path, version).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CatalogRow {
    pub id: i64,
    pub path: String,
    pub version: String,
    pub content: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// noetl.workload
// ---------------------------------------------------------------------------

/// The initial parameter mapping captured for an execution.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkloadRow {
    pub execution_id: i64,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// noetl.event
// ---------------------------------------------------------------------------

/// A single immutable entry in the append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventRow {
    pub id: i64,
    pub event_id: i64,
    pub execution_id: i64,
    pub catalog_id: i64,
    pub parent_event_id: Option<i64>,
    pub parent_execution_id: Option<i64>,
    pub parent_step: Option<String>,
    pub event_type: String,
    pub status: String,
    pub node_id: Option<String>,
    pub node_name: Option<String>,
    pub node_type: Option<String>,
    pub context: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub meta: Option<serde_json::Value>,
    pub worker_id: Option<String>,
    pub attempt: Option<i32>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// noetl.queue
// ---------------------------------------------------------------------------

/// Status of a queue task, matching the state machine in spec §3/§4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Leased,
    Retry,
    Done,
    Dead,
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Leased => "leased",
            Self::Retry => "retry",
            Self::Done => "done",
            Self::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "leased" => Ok(Self::Leased),
            "retry" => Ok(Self::Retry),
            "done" => Ok(Self::Done),
            "dead" => Ok(Self::Dead),
            other => Err(format!("unknown queue status: {other}")),
        }
    }
}

/// A mutable work item, see spec §3 "Queue task".
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QueueTaskRow {
    pub id: i64,
    pub queue_id: i64,
    pub execution_id: i64,
    pub catalog_id: i64,
    pub node_id: String,
    pub node_name: String,
    /// Base64-encoded action payload, so it survives transport untouched.
    pub payload: String,
    pub context: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub priority: i32,
    pub available_at: DateTime<Utc>,
    pub lease_until: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueTaskRow {
    pub fn status(&self) -> QueueStatus {
        self.status.parse().expect("db-stored status is always valid")
    }
}

// ---------------------------------------------------------------------------
// noetl.error_log
// ---------------------------------------------------------------------------

/// A diagnostic record of a template-rendering failure, distinct from the
/// event log (spec §4.3 "Failure semantics").
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ErrorLogRow {
    pub id: i64,
    pub execution_id: i64,
    pub node_id: Option<String>,
    pub template: String,
    pub available_keys: serde_json::Value,
    pub message: String,
    pub created_at: DateTime<Utc>,
}
