//! Inputs to queue operations.

use serde::{Deserialize, Serialize};

/// A task to be enqueued, prior to id assignment.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub execution_id: i64,
    pub catalog_id: i64,
    pub node_id: String,
    pub node_name: String,
    /// Base64-encoded action payload (spec §3 "to survive transport").
    pub payload: String,
    pub context: serde_json::Value,
    pub priority: i32,
    pub max_attempts: i32,
}

impl NewTask {
    pub fn new(
        execution_id: i64,
        catalog_id: i64,
        node_id: impl Into<String>,
        node_name: impl Into<String>,
        payload: impl Into<String>,
        context: serde_json::Value,
    ) -> Self {
        Self {
            execution_id,
            catalog_id,
            node_id: node_id.into(),
            node_name: node_name.into(),
            payload: payload.into(),
            context,
            priority: 0,
            max_attempts: 3,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// The retry evaluator's verdict, fed back into [`crate::fail`] (spec §4.2
/// `fail(queue_id, worker_id, error, retry_decision)`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RetryDecision {
    Retry { delay_seconds: f64 },
    Dead,
}
