//! Template-rendering diagnostic log, distinct from the event log
//! (spec §4.3 "these errors are recorded in a dedicated error log").

use chrono::Utc;

use crate::{models::ErrorLogRow, DbError, DbPool};

pub async fn insert(
    pool: &DbPool,
    execution_id: i64,
    node_id: Option<&str>,
    template: &str,
    available_keys: serde_json::Value,
    message: &str,
) -> Result<ErrorLogRow, DbError> {
    let row = sqlx::query_as::<_, ErrorLogRow>(
        r#"
        INSERT INTO noetl.error_log
            (execution_id, node_id, template, available_keys, message, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id, execution_id, node_id, template, available_keys, message, created_at
        "#,
    )
    .bind(execution_id)
    .bind(node_id)
    .bind(template)
    .bind(available_keys)
    .bind(message)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(row)
}

pub async fn by_execution(
    pool: &DbPool,
    execution_id: i64,
) -> Result<Vec<ErrorLogRow>, DbError> {
    let rows = sqlx::query_as::<_, ErrorLogRow>(
        r#"
        SELECT id, execution_id, node_id, template, available_keys, message, created_at
        FROM noetl.error_log
        WHERE execution_id = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
