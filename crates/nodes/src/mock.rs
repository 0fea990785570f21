//! `MockExecutor` — a test double for `ActionExecutor`.
//!
//! Used directly by the unit tests below, and by the broker scenario tests
//! in `engine/tests/scenarios.rs` (spec §8 "Concrete scenarios") where a
//! real executor is unavailable or irrelevant.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

use crate::{traits::ActionContext, ActionError, ActionExecutor};

/// Behaviour injected into `MockExecutor` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Fail on the first `n` calls, then succeed with the given value —
    /// models spec §8 scenario 2 ("worker that fails on attempts 1,2 and
    /// succeeds on 3").
    FailThenSucceed { failures: usize, value: Value },
}

/// A mock executor that records every call it receives and returns a
/// programmer-specified result.
pub struct MockExecutor {
    pub name: String,
    pub behaviour: MockBehaviour,
    pub calls: Arc<Mutex<Vec<Value>>>,
}

impl MockExecutor {
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            behaviour: MockBehaviour::ReturnValue(value),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            behaviour: MockBehaviour::FailFatal(msg.into()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            behaviour: MockBehaviour::FailRetryable(msg.into()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing_then_succeeding(name: impl Into<String>, failures: usize, value: Value) -> Self {
        Self {
            name: name.into(),
            behaviour: MockBehaviour::FailThenSucceed { failures, value },
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ActionExecutor for MockExecutor {
    async fn execute(&self, input: Value, ctx: &ActionContext) -> Result<Value, ActionError> {
        self.calls.lock().unwrap().push(input.clone());

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(envelope(&self.name, v)),
            MockBehaviour::FailRetryable(msg) => Err(ActionError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(ActionError::Fatal(msg.clone())),
            MockBehaviour::FailThenSucceed { failures, value } => {
                if (ctx.attempt as usize) <= *failures {
                    Err(ActionError::Retryable(format!(
                        "{} failing on attempt {}",
                        self.name, ctx.attempt
                    )))
                } else {
                    Ok(envelope(&self.name, value))
                }
            }
        }
    }
}

fn envelope(name: &str, v: &Value) -> Value {
    let mut out = json!({ "node": name });
    if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), v.as_object()) {
        for (k, val) in v_obj {
            out_obj.insert(k.clone(), val.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(attempt: i32) -> ActionContext {
        ActionContext {
            execution_id: 1,
            node_id: "1-step".to_string(),
            node_name: "step".to_string(),
            attempt,
        }
    }

    #[tokio::test]
    async fn returning_yields_envelope_and_records_call() {
        let exec = MockExecutor::returning("step", json!({ "x": 1 }));
        let out = exec.execute(json!({ "in": true }), &ctx(1)).await.unwrap();
        assert_eq!(out, json!({ "node": "step", "x": 1 }));
        assert_eq!(exec.call_count(), 1);
    }

    #[tokio::test]
    async fn failing_retryable_returns_retryable_error() {
        let exec = MockExecutor::failing_retryable("step", "boom");
        let err = exec.execute(json!({}), &ctx(1)).await.unwrap_err();
        assert!(matches!(err, ActionError::Retryable(msg) if msg == "boom"));
    }

    #[tokio::test]
    async fn failing_fatal_returns_fatal_error() {
        let exec = MockExecutor::failing_fatal("step", "nope");
        let err = exec.execute(json!({}), &ctx(1)).await.unwrap_err();
        assert!(matches!(err, ActionError::Fatal(msg) if msg == "nope"));
    }

    #[tokio::test]
    async fn failing_then_succeeding_fails_for_n_attempts_then_succeeds() {
        let exec = MockExecutor::failing_then_succeeding("step", 2, json!({ "done": true }));

        assert!(exec.execute(json!({}), &ctx(1)).await.is_err());
        assert!(exec.execute(json!({}), &ctx(2)).await.is_err());
        let out = exec.execute(json!({}), &ctx(3)).await.unwrap();

        assert_eq!(out, json!({ "node": "step", "done": true }));
        assert_eq!(exec.call_count(), 3);
    }
}
