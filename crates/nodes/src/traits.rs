//! The `ActionExecutor` trait — the contract every action type's worker
//! implementation fulfils.
//!
//! Concrete executors (http, python, postgres, duckdb, secrets, workbook,
//! playbook, iterator — spec §9 "Polymorphism over action types") are
//! explicitly out of scope; this crate defines only the trait boundary plus
//! a couple of reference/mock executors used to exercise the broker and
//! queue without a live worker fleet.

use async_trait::async_trait;
use serde_json::Value;

use crate::ActionError;

/// Everything an executor needs beyond its rendered input: identity of the
/// execution and node it is running for, and the iteration index if any.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub execution_id: i64,
    pub node_id: String,
    pub node_name: String,
    pub attempt: i32,
}

/// The core action trait. The broker's relationship to every action type is
/// identical: enqueue + wait for `action_completed`/`action_error`; only the
/// executor dispatches on the action's tag.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, input: Value, ctx: &ActionContext) -> Result<Value, ActionError>;
}
