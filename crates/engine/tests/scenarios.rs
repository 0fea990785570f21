//! Scenario tests driving the broker end to end (spec §8 "Concrete
//! scenarios") against a real Postgres database and `nodes::mock`
//! executors. Require `DATABASE_URL` to point at a reachable Postgres
//! instance with the `noetl` schema creatable by that role; skipped
//! (with a message) otherwise, since no such instance is assumed to be
//! present in every environment this workspace builds in.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use db::{DbPool, Snowflake};
use engine::{Broker, PlaybookRef};
use nodes::mock::MockExecutor;
use nodes::{registry_with, ActionContext, ActionError, ExecutorRegistry};
use serde_json::{json, Value};

async fn test_pool(worker_id: u64) -> Option<(DbPool, Broker)> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = db::pool::create_pool(&url, 5)
        .await
        .expect("failed to connect to DATABASE_URL");
    db::pool::run_migrations(&pool).await.expect("migrations failed");
    let broker = Broker::new(pool.clone(), Snowflake::new(worker_id));
    Some((pool, broker))
}

/// Lease and execute every due task against `registry` until the execution
/// reaches a terminal state or `max_rounds` is exceeded (a test-only
/// stand-in for the CLI's `run_worker_loop`, driving deterministic mock
/// executors instead of polling on a timer).
async fn drain(pool: &DbPool, broker: &Broker, registry: &ExecutorRegistry, execution_id: i64, max_rounds: usize) {
    for _ in 0..max_rounds {
        let events = db::repository::events::stream(pool, execution_id).await.unwrap();
        if let Some(state) = engine::WorkflowState::from_events(&events) {
            if state.state.is_terminal() {
                return;
            }
        }

        let Some(task) = queue::lease(pool, "test-worker", 30).await.unwrap() else {
            tokio::time::sleep(Duration::from_millis(20)).await;
            continue;
        };

        let decoded = base64::engine::general_purpose::STANDARD.decode(&task.payload).unwrap();
        let input: Value = serde_json::from_slice(&decoded).unwrap();

        let catalog_row = db::repository::catalog::get_by_id(pool, task.catalog_id).await.unwrap();
        let playbook = engine::parse_playbook(&catalog_row.content).unwrap();
        let owner_name = task.node_name.strip_suffix("-sink").unwrap_or(task.node_name.as_str());
        let action_type = playbook.find_step(owner_name).and_then(|s| s.action_type.clone());

        db::repository::events::append(
            pool,
            broker.ids(),
            db::repository::events::NewEvent {
                execution_id: task.execution_id,
                catalog_id: task.catalog_id,
                parent_event_id: None,
                parent_execution_id: None,
                parent_step: None,
                event_type: "action_started".to_string(),
                status: "ok".to_string(),
                node_id: Some(task.node_id.clone()),
                node_name: Some(task.node_name.clone()),
                node_type: action_type.clone(),
                context: Some(task.context.clone()),
                result: None,
                meta: Some(json!({ "queue_id": task.queue_id })),
                worker_id: Some("test-worker".to_string()),
                attempt: Some(task.attempts),
            },
        )
        .await
        .unwrap();

        let outcome = match &action_type {
            Some(tag) => match registry.get(tag.as_str()) {
                Some(executor) => {
                    let ctx = ActionContext {
                        execution_id: task.execution_id,
                        node_id: task.node_id.clone(),
                        node_name: task.node_name.clone(),
                        attempt: task.attempts,
                    };
                    executor.execute(input, &ctx).await
                }
                None => Err(ActionError::Fatal(format!("no executor for '{tag}'"))),
            },
            None => Err(ActionError::Fatal(format!("step '{owner_name}' has no action type"))),
        };

        match outcome {
            Ok(result) => {
                db::repository::events::append(
                    pool,
                    broker.ids(),
                    db::repository::events::NewEvent {
                        execution_id: task.execution_id,
                        catalog_id: task.catalog_id,
                        parent_event_id: None,
                        parent_execution_id: None,
                        parent_step: None,
                        event_type: "action_completed".to_string(),
                        status: "ok".to_string(),
                        node_id: Some(task.node_id.clone()),
                        node_name: Some(task.node_name.clone()),
                        node_type: action_type,
                        context: Some(task.context.clone()),
                        result: Some(result),
                        meta: Some(json!({ "queue_id": task.queue_id })),
                        worker_id: Some("test-worker".to_string()),
                        attempt: Some(task.attempts),
                    },
                )
                .await
                .unwrap();
                queue::complete(pool, task.queue_id, "test-worker").await.unwrap();
                broker.evaluate_execution(task.execution_id, "action_completed").await.unwrap();
            }
            Err(err) => {
                let message = match &err {
                    ActionError::Retryable(m) | ActionError::Fatal(m) => m.clone(),
                };
                db::repository::events::append(
                    pool,
                    broker.ids(),
                    db::repository::events::NewEvent {
                        execution_id: task.execution_id,
                        catalog_id: task.catalog_id,
                        parent_event_id: None,
                        parent_execution_id: None,
                        parent_step: None,
                        event_type: "action_error".to_string(),
                        status: "error".to_string(),
                        node_id: Some(task.node_id.clone()),
                        node_name: Some(task.node_name.clone()),
                        node_type: action_type,
                        context: Some(task.context.clone()),
                        result: Some(json!({ "error": message })),
                        meta: Some(json!({ "queue_id": task.queue_id })),
                        worker_id: Some("test-worker".to_string()),
                        attempt: Some(task.attempts),
                    },
                )
                .await
                .unwrap();
                broker.evaluate_execution(task.execution_id, "action_error").await.unwrap();
            }
        }
    }
    panic!("execution {execution_id} did not reach a terminal state within {max_rounds} rounds");
}

fn linear_playbook() -> Value {
    json!({
        "workflow": [
            { "name": "start", "type": "mock", "next": [{ "then": [{ "step": "end" }] }] },
            { "name": "end", "type": "end" },
        ]
    })
}

#[tokio::test]
async fn linear_playbook_completes_with_mock_executor() {
    let Some((pool, broker)) = test_pool(101).await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };

    let content = linear_playbook();
    let catalog = db::repository::catalog::register(
        &pool,
        broker.ids(),
        "tests/linear",
        &uuid_like_version(),
        content,
    )
    .await
    .unwrap();

    let registry = registry_with(vec![(
        "mock",
        Arc::new(MockExecutor::returning("start", json!({ "ok": true }))) as Arc<dyn nodes::ActionExecutor>,
    )]);

    let execution_id = broker
        .submit(&PlaybookRef { catalog_id: Some(catalog.id), path: None, version: None }, json!({}), None)
        .await
        .unwrap();

    drain(&pool, &broker, &registry, execution_id, 50).await;

    let events = db::repository::events::stream(&pool, execution_id).await.unwrap();
    let state = engine::WorkflowState::from_events(&events).unwrap();
    assert_eq!(state.state, engine::ExecutionState::Completed);

    let results = db::repository::events::results_by_node(&pool, execution_id).await.unwrap();
    assert!(results.iter().any(|(name, _)| name == "start"));
}

fn iterator_playbook() -> Value {
    json!({
        "workflow": [
            { "name": "start", "type": "route", "next": [{ "then": [{ "step": "fan_out" }] }] },
            {
                "name": "fan_out",
                "type": "mock",
                "loop": { "collection": "{{ [1, 2] }}", "as": "item", "mode": "sequential" },
                "next": [{ "then": [{ "step": "end" }] }],
            },
            { "name": "end", "type": "end" },
        ]
    })
}

#[tokio::test]
async fn inline_iterator_emits_loop_completed_then_step_completed() {
    let Some((pool, broker)) = test_pool(102).await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };

    let content = iterator_playbook();
    let catalog = db::repository::catalog::register(
        &pool,
        broker.ids(),
        "tests/iterator",
        &uuid_like_version(),
        content,
    )
    .await
    .unwrap();

    let registry = registry_with(vec![(
        "mock",
        Arc::new(MockExecutor::returning("fan_out", json!({ "n": 1 }))) as Arc<dyn nodes::ActionExecutor>,
    )]);

    let execution_id = broker
        .submit(&PlaybookRef { catalog_id: Some(catalog.id), path: None, version: None }, json!({}), None)
        .await
        .unwrap();

    drain(&pool, &broker, &registry, execution_id, 50).await;

    let events = db::repository::events::stream(&pool, execution_id).await.unwrap();
    let types: Vec<&str> = events
        .iter()
        .filter(|e| e.node_name.as_deref() == Some("fan_out"))
        .map(|e| e.event_type.as_str())
        .collect();
    let loop_completed_at = types.iter().position(|t| *t == "loop_completed");
    let step_completed_at = types.iter().position(|t| *t == "step_completed");
    assert!(loop_completed_at.is_some(), "expected a loop_completed event, got {types:?}");
    assert!(step_completed_at.is_some(), "expected a step_completed event, got {types:?}");
    assert!(loop_completed_at < step_completed_at);

    let results = db::repository::events::results_by_node(&pool, execution_id).await.unwrap();
    let fan_out_result = results.iter().find(|(name, _)| name == "fan_out").map(|(_, v)| v);
    assert!(fan_out_result.is_some(), "iterator step result missing from results_by_node");
    assert_eq!(fan_out_result.unwrap()["items"].as_array().unwrap().len(), 2);
}

/// A short unique suffix for catalog (path, version) pairs so repeated test
/// runs against a persistent database don't collide on the unique index.
fn uuid_like_version() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("test-{nanos}")
}
