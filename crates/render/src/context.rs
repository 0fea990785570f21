//! Context construction (spec §4.3 "Context construction").

use db::DbPool;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::RenderError;

/// One element of an active iteration scope, layered onto the base context
/// (spec §4.3 "For iteration scopes").
#[derive(Debug, Clone)]
pub struct IterationScope {
    /// The alias the playbook binds the current element to, e.g. `city`.
    pub alias: String,
    pub element: Value,
    /// The current action's own envelope (`this`).
    pub this: Value,
    pub loop_index: usize,
    pub loop_count: usize,
}

impl IterationScope {
    fn apply(&self, ctx: &mut Map<String, Value>) {
        ctx.insert(self.alias.clone(), self.element.clone());
        ctx.insert("this".to_string(), self.this.clone());
        ctx.insert(
            "_loop".to_string(),
            serde_json::json!({
                "index": self.loop_index,
                "count": self.loop_count,
            }),
        );
    }
}

/// If a step result wraps `{status, data, …}`, return the unwrapped `data`
/// so templates can write `{{ step.field }}` instead of
/// `{{ step.data.field }}` (spec §4.3).
fn unwrap_envelope(result: &Value) -> Value {
    match result.as_object() {
        Some(obj) if obj.contains_key("status") && obj.contains_key("data") => {
            obj.get("data").cloned().unwrap_or(Value::Null)
        }
        _ => result.clone(),
    }
}

/// Assemble the rendering context for an execution: workload, per-step
/// results, execution metadata, a fresh `job.uuid`, and an `env.*` snapshot,
/// optionally layered with an active iteration scope and caller-supplied
/// extras that override matching keys.
pub async fn build_context(
    pool: &DbPool,
    execution_id: i64,
    iteration: Option<&IterationScope>,
    extras: Option<&Value>,
) -> Result<Value, RenderError> {
    let mut ctx = Map::new();

    let workload = db::repository::workload::get(pool, execution_id).await?;
    if let Some(obj) = workload.data.as_object() {
        for (k, v) in obj {
            ctx.insert(k.clone(), v.clone());
        }
    } else if !workload.data.is_null() {
        ctx.insert("workload".to_string(), workload.data);
    }

    let results = db::repository::events::results_by_node(pool, execution_id).await?;
    for (node_name, result) in results {
        ctx.insert(node_name, unwrap_envelope(&result));
    }

    ctx.insert("execution_id".to_string(), Value::from(execution_id));
    ctx.insert(
        "job".to_string(),
        serde_json::json!({ "uuid": Uuid::new_v4().to_string() }),
    );
    ctx.insert("env".to_string(), env_snapshot());

    if let Some(scope) = iteration {
        scope.apply(&mut ctx);
    }

    if let Some(extras) = extras {
        if let Some(obj) = extras.as_object() {
            for (k, v) in obj {
                ctx.insert(k.clone(), v.clone());
            }
        }
    }

    Ok(Value::Object(ctx))
}

fn env_snapshot() -> Value {
    let mut env = Map::new();
    for (k, v) in std::env::vars() {
        env.insert(k, Value::String(v));
    }
    Value::Object(env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwraps_status_data_envelope() {
        let wrapped = serde_json::json!({"status": "ok", "data": {"value": 42}});
        assert_eq!(unwrap_envelope(&wrapped), serde_json::json!({"value": 42}));
    }

    #[test]
    fn passes_through_plain_results() {
        let plain = serde_json::json!({"value": 42});
        assert_eq!(unwrap_envelope(&plain), plain);
    }

    #[test]
    fn iteration_scope_sets_alias_this_and_loop_keys() {
        let scope = IterationScope {
            alias: "city".to_string(),
            element: serde_json::json!("nyc"),
            this: serde_json::json!({"node": "fan_out"}),
            loop_index: 1,
            loop_count: 3,
        };
        let mut ctx = Map::new();
        scope.apply(&mut ctx);
        assert_eq!(ctx["city"], serde_json::json!("nyc"));
        assert_eq!(ctx["_loop"]["index"], serde_json::json!(1));
        assert_eq!(ctx["_loop"]["count"], serde_json::json!(3));
    }
}
