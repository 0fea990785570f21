//! Execution workload storage.
//!
//! Workload is the initial parameter mapping captured at `execution_start`
//! (spec §3 "Execution"); the renderer's `earliest_context` reads it back
//! unchanged for the lifetime of the execution.

use chrono::Utc;

use crate::{models::WorkloadRow, DbError, DbPool};

/// Persist the initial workload for a freshly created execution.
pub async fn insert(
    pool: &DbPool,
    execution_id: i64,
    data: serde_json::Value,
) -> Result<WorkloadRow, DbError> {
    let row = sqlx::query_as::<_, WorkloadRow>(
        r#"
        INSERT INTO noetl.workload (execution_id, data, created_at)
        VALUES ($1, $2, $3)
        RETURNING execution_id, data, created_at
        "#,
    )
    .bind(execution_id)
    .bind(data)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Fetch the workload recorded for an execution.
pub async fn get(pool: &DbPool, execution_id: i64) -> Result<WorkloadRow, DbError> {
    sqlx::query_as::<_, WorkloadRow>(
        r#"SELECT execution_id, data, created_at FROM noetl.workload WHERE execution_id = $1"#,
    )
    .bind(execution_id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)
}
