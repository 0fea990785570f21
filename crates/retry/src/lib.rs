//! `retry` crate — the retry policy evaluator (spec §4.4).

pub mod error;
pub mod eval;
pub mod policy;

pub use error::RetryError;
pub use eval::{evaluate_continuation, evaluate_failure, ContinuationOutcome, FailureOutcome};
pub use policy::{BackoffPolicy, CollectSpec, ContinuationSpec, RetryPolicy, ThenClause, WhenThenEntry};
