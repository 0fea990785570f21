pub mod events;
pub mod executions;
pub mod queue;

pub use crate::AppState;

use axum::http::StatusCode;
use engine::EngineError;

/// Maps a broker error onto an HTTP status, per spec §7's error kinds: a
/// playbook-structural error is a client mistake (400), anything else is
/// either "not found" or an internal failure.
pub fn engine_error_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::DuplicateNodeId(_)
        | EngineError::UnknownNodeReference { .. }
        | EngineError::CycleDetected
        | EngineError::MissingStartStep
        | EngineError::MissingWorkbookReference { .. } => StatusCode::BAD_REQUEST,
        EngineError::Database(db::DbError::NotFound) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
