//! The durable task queue (spec §4.2).
//!
//! At-most-one-outstanding-lease per task, fair-ish ordering by priority
//! then insertion order, atomic lease acquisition via
//! `SELECT ... FOR UPDATE SKIP LOCKED`.

use chrono::{Duration as ChronoDuration, Utc};
use db::{models::QueueTaskRow, DbPool, Snowflake};

use crate::error::QueueError;
use crate::task::{NewTask, RetryDecision};

/// Insert a `queued` row. Idempotent on `(execution_id, node_id)`: a second
/// enqueue for the same pair returns the existing row untouched, matching
/// the "no duplicate rows per (execution_id, node_id)" testable property.
pub async fn enqueue(
    pool: &DbPool,
    ids: &Snowflake,
    task: NewTask,
) -> Result<QueueTaskRow, QueueError> {
    if let Some(existing) = find_by_node(pool, task.execution_id, &task.node_id).await? {
        return Ok(existing);
    }

    let id = ids.next_id();
    let queue_id = id;
    let now = Utc::now();

    let row = sqlx::query_as::<_, QueueTaskRow>(
        r#"
        INSERT INTO noetl.queue (
            id, queue_id, execution_id, catalog_id, node_id, node_name,
            payload, context, status, attempts, max_attempts, priority,
            available_at, lease_until, worker_id, last_heartbeat, last_error,
            created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'queued', 0, $9, $10, $11, NULL, NULL, NULL, NULL, $11, $11)
        ON CONFLICT (execution_id, node_id) DO NOTHING
        RETURNING id, queue_id, execution_id, catalog_id, node_id, node_name, payload, context,
                  status, attempts, max_attempts, priority, available_at, lease_until, worker_id,
                  last_heartbeat, last_error, created_at, updated_at
        "#,
    )
    .bind(id)
    .bind(queue_id)
    .bind(task.execution_id)
    .bind(task.catalog_id)
    .bind(&task.node_id)
    .bind(&task.node_name)
    .bind(&task.payload)
    .bind(&task.context)
    .bind(task.max_attempts)
    .bind(task.priority)
    .bind(now)
    .fetch_optional(pool)
    .await
    .map_err(db::DbError::from)?;

    match row {
        Some(row) => Ok(row),
        None => find_by_node(pool, task.execution_id, &task.node_id)
            .await?
            .ok_or(QueueError::NotFound { queue_id }),
    }
}

async fn find_by_node(
    pool: &DbPool,
    execution_id: i64,
    node_id: &str,
) -> Result<Option<QueueTaskRow>, QueueError> {
    let row = sqlx::query_as::<_, QueueTaskRow>(
        r#"
        SELECT id, queue_id, execution_id, catalog_id, node_id, node_name, payload, context,
               status, attempts, max_attempts, priority, available_at, lease_until, worker_id,
               last_heartbeat, last_error, created_at, updated_at
        FROM noetl.queue
        WHERE execution_id = $1 AND node_id = $2
        "#,
    )
    .bind(execution_id)
    .bind(node_id)
    .fetch_optional(pool)
    .await
    .map_err(db::DbError::from)?;

    Ok(row)
}

/// Atomically select one eligible task (`queued` or `retry`, `available_at
/// <= now`), lock it, and transition it to `leased`. Workers may call this
/// concurrently without coordinating: `FOR UPDATE SKIP LOCKED` means a
/// worker never blocks on a row another worker is already claiming.
pub async fn lease(
    pool: &DbPool,
    worker_id: &str,
    lease_seconds: i64,
) -> Result<Option<QueueTaskRow>, QueueError> {
    let mut tx = pool.begin().await.map_err(db::DbError::from)?;
    let now = Utc::now();

    let candidate = sqlx::query_as::<_, QueueTaskRow>(
        r#"
        SELECT id, queue_id, execution_id, catalog_id, node_id, node_name, payload, context,
               status, attempts, max_attempts, priority, available_at, lease_until, worker_id,
               last_heartbeat, last_error, created_at, updated_at
        FROM noetl.queue
        WHERE status IN ('queued', 'retry') AND available_at <= $1
        ORDER BY priority DESC, queue_id ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(now)
    .fetch_optional(&mut *tx)
    .await
    .map_err(db::DbError::from)?;

    let Some(candidate) = candidate else {
        tx.rollback().await.map_err(db::DbError::from)?;
        return Ok(None);
    };

    let lease_until = now + ChronoDuration::seconds(lease_seconds);

    let leased = sqlx::query_as::<_, QueueTaskRow>(
        r#"
        UPDATE noetl.queue
        SET status = 'leased',
            worker_id = $1,
            lease_until = $2,
            attempts = attempts + 1,
            last_heartbeat = $3,
            updated_at = $3
        WHERE id = $4
        RETURNING id, queue_id, execution_id, catalog_id, node_id, node_name, payload, context,
                  status, attempts, max_attempts, priority, available_at, lease_until, worker_id,
                  last_heartbeat, last_error, created_at, updated_at
        "#,
    )
    .bind(worker_id)
    .bind(lease_until)
    .bind(now)
    .bind(candidate.id)
    .fetch_one(&mut *tx)
    .await
    .map_err(db::DbError::from)?;

    tx.commit().await.map_err(db::DbError::from)?;
    Ok(Some(leased))
}

/// Extend a held lease. Rejects the call if `worker_id` does not currently
/// hold it.
pub async fn heartbeat(
    pool: &DbPool,
    queue_id: i64,
    worker_id: &str,
    lease_seconds: i64,
) -> Result<QueueTaskRow, QueueError> {
    let now = Utc::now();
    let lease_until = now + ChronoDuration::seconds(lease_seconds);

    let row = sqlx::query_as::<_, QueueTaskRow>(
        r#"
        UPDATE noetl.queue
        SET lease_until = $1, last_heartbeat = $2, updated_at = $2
        WHERE queue_id = $3 AND worker_id = $4 AND status = 'leased'
        RETURNING id, queue_id, execution_id, catalog_id, node_id, node_name, payload, context,
                  status, attempts, max_attempts, priority, available_at, lease_until, worker_id,
                  last_heartbeat, last_error, created_at, updated_at
        "#,
    )
    .bind(lease_until)
    .bind(now)
    .bind(queue_id)
    .bind(worker_id)
    .fetch_optional(pool)
    .await
    .map_err(db::DbError::from)?;

    row.ok_or_else(|| QueueError::NotLeaseOwner {
        queue_id,
        worker_id: worker_id.to_string(),
    })
}

/// Mark a task `done`. A no-op if it is already `done`; rejected if the
/// caller does not hold the lease.
pub async fn complete(
    pool: &DbPool,
    queue_id: i64,
    worker_id: &str,
) -> Result<QueueTaskRow, QueueError> {
    let current = get(pool, queue_id).await?;

    if current.status() == db::models::QueueStatus::Done {
        return Ok(current);
    }
    if current.worker_id.as_deref() != Some(worker_id) || current.status() != db::models::QueueStatus::Leased {
        return Err(QueueError::NotLeaseOwner {
            queue_id,
            worker_id: worker_id.to_string(),
        });
    }

    let now = Utc::now();
    let row = sqlx::query_as::<_, QueueTaskRow>(
        r#"
        UPDATE noetl.queue
        SET status = 'done', lease_until = NULL, updated_at = $1
        WHERE queue_id = $2 AND worker_id = $3
        RETURNING id, queue_id, execution_id, catalog_id, node_id, node_name, payload, context,
                  status, attempts, max_attempts, priority, available_at, lease_until, worker_id,
                  last_heartbeat, last_error, created_at, updated_at
        "#,
    )
    .bind(now)
    .bind(queue_id)
    .bind(worker_id)
    .fetch_one(pool)
    .await
    .map_err(db::DbError::from)?;

    Ok(row)
}

/// Apply the retry evaluator's decision to a failed task: either schedule a
/// future lease attempt (`retry`) or mark it permanently `dead`.
pub async fn fail(
    pool: &DbPool,
    queue_id: i64,
    worker_id: &str,
    error: &str,
    decision: RetryDecision,
) -> Result<QueueTaskRow, QueueError> {
    let current = get(pool, queue_id).await?;
    if current.worker_id.as_deref() != Some(worker_id) || current.status() != db::models::QueueStatus::Leased {
        return Err(QueueError::NotLeaseOwner {
            queue_id,
            worker_id: worker_id.to_string(),
        });
    }

    let now = Utc::now();
    let (status, available_at) = match decision {
        RetryDecision::Retry { delay_seconds } => (
            "retry",
            now + ChronoDuration::milliseconds((delay_seconds * 1000.0) as i64),
        ),
        RetryDecision::Dead => ("dead", now),
    };

    let row = sqlx::query_as::<_, QueueTaskRow>(
        r#"
        UPDATE noetl.queue
        SET status = $1, available_at = $2, lease_until = NULL, last_error = $3, updated_at = $4
        WHERE queue_id = $5 AND worker_id = $6
        RETURNING id, queue_id, execution_id, catalog_id, node_id, node_name, payload, context,
                  status, attempts, max_attempts, priority, available_at, lease_until, worker_id,
                  last_heartbeat, last_error, created_at, updated_at
        "#,
    )
    .bind(status)
    .bind(available_at)
    .bind(error)
    .bind(now)
    .bind(queue_id)
    .bind(worker_id)
    .fetch_one(pool)
    .await
    .map_err(db::DbError::from)?;

    Ok(row)
}

/// Return leased tasks whose lease has expired to `queued`, preserving
/// `attempts`, so another worker may pick them up.
pub async fn reclaim(pool: &DbPool) -> Result<Vec<QueueTaskRow>, QueueError> {
    let now = Utc::now();
    let rows = sqlx::query_as::<_, QueueTaskRow>(
        r#"
        UPDATE noetl.queue
        SET status = 'queued', worker_id = NULL, lease_until = NULL, updated_at = $1
        WHERE status = 'leased' AND lease_until < $1
        RETURNING id, queue_id, execution_id, catalog_id, node_id, node_name, payload, context,
                  status, attempts, max_attempts, priority, available_at, lease_until, worker_id,
                  last_heartbeat, last_error, created_at, updated_at
        "#,
    )
    .bind(now)
    .fetch_all(pool)
    .await
    .map_err(db::DbError::from)?;

    Ok(rows)
}

pub async fn get(pool: &DbPool, queue_id: i64) -> Result<QueueTaskRow, QueueError> {
    sqlx::query_as::<_, QueueTaskRow>(
        r#"
        SELECT id, queue_id, execution_id, catalog_id, node_id, node_name, payload, context,
               status, attempts, max_attempts, priority, available_at, lease_until, worker_id,
               last_heartbeat, last_error, created_at, updated_at
        FROM noetl.queue
        WHERE queue_id = $1
        "#,
    )
    .bind(queue_id)
    .fetch_optional(pool)
    .await
    .map_err(db::DbError::from)?
    .ok_or(QueueError::NotFound { queue_id })
}

/// List queue rows for operator tooling (`GET /queue`), optionally filtered
/// by status and/or execution id.
pub async fn list(
    pool: &DbPool,
    status: Option<&str>,
    execution_id: Option<i64>,
    limit: i64,
) -> Result<Vec<QueueTaskRow>, QueueError> {
    let rows = sqlx::query_as::<_, QueueTaskRow>(
        r#"
        SELECT id, queue_id, execution_id, catalog_id, node_id, node_name, payload, context,
               status, attempts, max_attempts, priority, available_at, lease_until, worker_id,
               last_heartbeat, last_error, created_at, updated_at
        FROM noetl.queue
        WHERE ($1::text IS NULL OR status = $1)
          AND ($2::bigint IS NULL OR execution_id = $2)
        ORDER BY created_at DESC
        LIMIT $3
        "#,
    )
    .bind(status)
    .bind(execution_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(db::DbError::from)?;

    Ok(rows)
}
