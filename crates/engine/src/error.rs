//! Engine-level error types.

use thiserror::Error;

/// Errors produced by the broker (playbook validation + evaluation).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Playbook-structural errors (spec §7 "Playbook structural error") ------
    /// Two or more steps share the same name.
    #[error("duplicate step name: '{0}'")]
    DuplicateNodeId(String),

    /// A transition references a step name that doesn't exist in the workflow.
    #[error("transition references unknown step '{node_id}' ({side} side)")]
    UnknownNodeReference { node_id: String, side: &'static str },

    /// Topological sort over transition targets detected a cycle.
    #[error("workflow graph contains a cycle")]
    CycleDetected,

    /// The workflow has no step named `start`.
    #[error("playbook has no 'start' step")]
    MissingStartStep,

    /// A step references a workbook entry that doesn't exist.
    #[error("step '{step}' references unknown workbook entry '{entry}'")]
    MissingWorkbookReference { step: String, entry: String },

    // ------ Evaluation errors ------
    /// A step failed fatally; evaluation proceeds to finalise the execution
    /// as failed.
    #[error("step '{node_id}' failed fatally: {message}")]
    NodeFatal { node_id: String, message: String },

    /// A step's retry policy was exhausted.
    #[error("step '{node_id}' exceeded retry limit: {message}")]
    NodeRetryExhausted { node_id: String, message: String },

    /// An event or queue row the broker expected to exist is missing.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    #[error("queue error: {0}")]
    Queue(#[from] queue::QueueError),

    #[error("render error: {0}")]
    Render(#[from] render::RenderError),

    #[error("retry error: {0}")]
    Retry(#[from] retry::RetryError),
}
