//! Action-level error type.

use thiserror::Error;

/// Errors returned by an action executor's `execute` method.
///
/// A worker reports the variant back to the broker as an `action_error`
/// event; the retry evaluator (`retry` crate) decides whether the owning
/// queue task re-enters `retry` or `dead`:
/// - `Retryable` — subject to the step's retry policy.
/// - `Fatal`     — no retry is attempted regardless of policy.
#[derive(Debug, Error, Clone)]
pub enum ActionError {
    #[error("retryable action error: {0}")]
    Retryable(String),

    #[error("fatal action error: {0}")]
    Fatal(String),
}
