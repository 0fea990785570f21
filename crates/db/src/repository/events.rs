//! Event log queries.
//!
//! The event log is the append-only source of truth (spec §4.1): every
//! write here is an insert, never an update, and the broker's entire
//! notion of "state" is folded from what these queries return.

use chrono::{DateTime, Utc};

use crate::{models::EventRow, DbError, DbPool, Snowflake};

/// A new event to be appended, prior to id assignment.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub execution_id: i64,
    pub catalog_id: i64,
    pub parent_event_id: Option<i64>,
    pub parent_execution_id: Option<i64>,
    pub parent_step: Option<String>,
    pub event_type: String,
    pub status: String,
    pub node_id: Option<String>,
    pub node_name: Option<String>,
    pub node_type: Option<String>,
    pub context: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub meta: Option<serde_json::Value>,
    pub worker_id: Option<String>,
    pub attempt: Option<i32>,
}

/// Append an event, assigning a fresh id via `ids`.
///
/// Re-entrant appends with an externally supplied `event_id` should call
/// [`append_with_id`] instead so the idempotence guarantee in spec §4.1
/// ("Re-entrant appends with an externally supplied event id are
/// idempotent") holds.
pub async fn append(pool: &DbPool, ids: &Snowflake, event: NewEvent) -> Result<EventRow, DbError> {
    append_with_id(pool, ids.next_id(), event).await
}

/// Append an event under a caller-supplied id. If an event with that id
/// already exists, the existing row is returned unchanged rather than
/// erroring (spec §4.1 "A duplicate event id is not an error").
pub async fn append_with_id(
    pool: &DbPool,
    event_id: i64,
    event: NewEvent,
) -> Result<EventRow, DbError> {
    if let Some(existing) = get_by_event_id(pool, event_id).await? {
        return Ok(existing);
    }

    let row = sqlx::query_as::<_, EventRow>(
        r#"
        INSERT INTO noetl.event (
            event_id, execution_id, catalog_id, parent_event_id, parent_execution_id,
            parent_step, event_type, status, node_id, node_name, node_type,
            context, meta, result, worker_id, attempt, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        ON CONFLICT (event_id) DO NOTHING
        RETURNING id, event_id, execution_id, catalog_id, parent_event_id, parent_execution_id,
                  parent_step, event_type, status, node_id, node_name, node_type,
                  context, result, meta, worker_id, attempt, created_at
        "#,
    )
    .bind(event_id)
    .bind(event.execution_id)
    .bind(event.catalog_id)
    .bind(event.parent_event_id)
    .bind(event.parent_execution_id)
    .bind(event.parent_step)
    .bind(&event.event_type)
    .bind(&event.status)
    .bind(&event.node_id)
    .bind(&event.node_name)
    .bind(&event.node_type)
    .bind(&event.context)
    .bind(&event.meta)
    .bind(&event.result)
    .bind(&event.worker_id)
    .bind(event.attempt)
    .bind(Utc::now())
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Ok(row),
        // Lost the ON CONFLICT race to a concurrent appender with the same id.
        None => get_by_event_id(pool, event_id)
            .await?
            .ok_or(DbError::NotFound),
    }
}

/// Look up an event by its (caller- or generator-assigned) `event_id`.
pub async fn get_by_event_id(pool: &DbPool, event_id: i64) -> Result<Option<EventRow>, DbError> {
    let event = sqlx::query_as::<_, EventRow>(
        r#"
        SELECT id, event_id, execution_id, catalog_id, parent_event_id, parent_execution_id,
               parent_step, event_type, status, node_id, node_name, node_type,
               context, result, meta, worker_id, attempt, created_at
        FROM noetl.event
        WHERE event_id = $1
        "#,
    )
    .bind(event_id)
    .fetch_optional(pool)
    .await?;

    Ok(event)
}

/// Total-ordered stream of every event for an execution (spec §4.1 `stream`).
pub async fn stream(pool: &DbPool, execution_id: i64) -> Result<Vec<EventRow>, DbError> {
    let events = sqlx::query_as::<_, EventRow>(
        r#"
        SELECT id, event_id, execution_id, catalog_id, parent_event_id, parent_execution_id,
               parent_step, event_type, status, node_id, node_name, node_type,
               context, result, meta, worker_id, attempt, created_at
        FROM noetl.event
        WHERE execution_id = $1
        ORDER BY event_id ASC
        "#,
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await?;

    Ok(events)
}

/// Events of a given execution filtered to specific event types, still in
/// event-id order.
pub async fn by_types(
    pool: &DbPool,
    execution_id: i64,
    event_types: &[&str],
) -> Result<Vec<EventRow>, DbError> {
    if event_types.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders: Vec<String> = (2..=event_types.len() + 1)
        .map(|i| format!("${i}"))
        .collect();
    let query = format!(
        r#"
        SELECT id, event_id, execution_id, catalog_id, parent_event_id, parent_execution_id,
               parent_step, event_type, status, node_id, node_name, node_type,
               context, result, meta, worker_id, attempt, created_at
        FROM noetl.event
        WHERE execution_id = $1 AND event_type IN ({})
        ORDER BY event_id ASC
        "#,
        placeholders.join(", ")
    );

    let mut builder = sqlx::query_as::<_, EventRow>(&query).bind(execution_id);
    for ty in event_types {
        builder = builder.bind(*ty);
    }

    Ok(builder.fetch_all(pool).await?)
}

/// The first event of an execution, i.e. its `execution_start`.
pub async fn earliest(pool: &DbPool, execution_id: i64) -> Result<Option<EventRow>, DbError> {
    let event = sqlx::query_as::<_, EventRow>(
        r#"
        SELECT id, event_id, execution_id, catalog_id, parent_event_id, parent_execution_id,
               parent_step, event_type, status, node_id, node_name, node_type,
               context, result, meta, worker_id, attempt, created_at
        FROM noetl.event
        WHERE execution_id = $1
        ORDER BY event_id ASC
        LIMIT 1
        "#,
    )
    .bind(execution_id)
    .fetch_optional(pool)
    .await?;

    Ok(event)
}

/// Most recent `action_completed` (or legacy `command.completed`) result for
/// a given node name — the basis of `results_by_node`'s "latest wins" rule.
pub async fn latest_result_by_node(
    pool: &DbPool,
    execution_id: i64,
    node_name: &str,
) -> Result<Option<serde_json::Value>, DbError> {
    let row: Option<(Option<serde_json::Value>,)> = sqlx::query_as(
        r#"
        SELECT result
        FROM noetl.event
        WHERE execution_id = $1
          AND node_name = $2
          AND event_type IN ('action_completed', 'command.completed', 'loop_completed')
        ORDER BY event_id DESC
        LIMIT 1
        "#,
    )
    .bind(execution_id)
    .bind(node_name)
    .fetch_optional(pool)
    .await?;

    Ok(row.and_then(|(r,)| r))
}

/// Map node name → most recent successful result, across every step that
/// has completed at least once (spec §4.1 `results_by_node`).
pub async fn results_by_node(
    pool: &DbPool,
    execution_id: i64,
) -> Result<Vec<(String, serde_json::Value)>, DbError> {
    let rows: Vec<(Option<String>, Option<serde_json::Value>)> = sqlx::query_as(
        r#"
        SELECT DISTINCT ON (node_name) node_name, result
        FROM noetl.event
        WHERE execution_id = $1
          AND event_type IN ('action_completed', 'command.completed', 'loop_completed')
          AND result IS NOT NULL
        ORDER BY node_name, event_id DESC
        "#,
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|(name, result)| name.zip(result))
        .collect())
}

/// Whether an event of the given type has ever been recorded for this
/// execution — used to make broker transitions idempotent
/// (`step_completed` once per step, `execution_complete` once per run).
pub async fn has_event_type(
    pool: &DbPool,
    execution_id: i64,
    event_type: &str,
) -> Result<bool, DbError> {
    let row: Option<(i32,)> = sqlx::query_as(
        r#"SELECT 1 FROM noetl.event WHERE execution_id = $1 AND event_type = $2 LIMIT 1"#,
    )
    .bind(execution_id)
    .bind(event_type)
    .fetch_optional(pool)
    .await?;

    Ok(row.is_some())
}

/// Whether the named node+event_type combination has already been recorded
/// — used to make `step_started`/`step_completed` per-node idempotent.
pub async fn has_node_event(
    pool: &DbPool,
    execution_id: i64,
    node_name: &str,
    event_type: &str,
) -> Result<bool, DbError> {
    let row: Option<(i32,)> = sqlx::query_as(
        r#"
        SELECT 1 FROM noetl.event
        WHERE execution_id = $1 AND node_name = $2 AND event_type = $3
        LIMIT 1
        "#,
    )
    .bind(execution_id)
    .bind(node_name)
    .bind(event_type)
    .fetch_optional(pool)
    .await?;

    Ok(row.is_some())
}

pub async fn count(
    pool: &DbPool,
    execution_id: i64,
    event_type: Option<&str>,
) -> Result<i64, DbError> {
    let count: (i64,) = if let Some(ty) = event_type {
        sqlx::query_as(
            r#"SELECT COUNT(*) FROM noetl.event WHERE execution_id = $1 AND event_type = $2"#,
        )
        .bind(execution_id)
        .bind(ty)
        .fetch_one(pool)
        .await?
    } else {
        sqlx::query_as(r#"SELECT COUNT(*) FROM noetl.event WHERE execution_id = $1"#)
            .bind(execution_id)
            .fetch_one(pool)
            .await?
    };

    Ok(count.0)
}

pub async fn since(
    pool: &DbPool,
    execution_id: i64,
    since: DateTime<Utc>,
) -> Result<Vec<EventRow>, DbError> {
    let events = sqlx::query_as::<_, EventRow>(
        r#"
        SELECT id, event_id, execution_id, catalog_id, parent_event_id, parent_execution_id,
               parent_step, event_type, status, node_id, node_name, node_type,
               context, result, meta, worker_id, attempt, created_at
        FROM noetl.event
        WHERE execution_id = $1 AND created_at > $2
        ORDER BY event_id ASC
        "#,
    )
    .bind(execution_id)
    .bind(since)
    .fetch_all(pool)
    .await?;

    Ok(events)
}
