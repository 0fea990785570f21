//! `EchoExecutor` — a reference executor that returns its input unchanged.
//!
//! Used by `noetl worker`'s in-process demonstration loop so the broker and
//! queue can be exercised end to end without a real http/python/postgres
//! worker (those are explicitly out of scope).

use async_trait::async_trait;
use serde_json::Value;

use crate::{traits::ActionContext, ActionError, ActionExecutor};

pub struct EchoExecutor;

#[async_trait]
impl ActionExecutor for EchoExecutor {
    async fn execute(&self, input: Value, _ctx: &ActionContext) -> Result<Value, ActionError> {
        Ok(input)
    }
}
