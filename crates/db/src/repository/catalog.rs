//! Playbook catalog lookups.
//!
//! The catalog/registry itself is out of scope; this module implements only
//! the minimal lookup interface the broker needs to resolve a
//! (path, version) or (path, "latest") reference at submission time.

use chrono::Utc;

use crate::{models::CatalogRow, DbError, DbPool, Snowflake};

/// Register a playbook document under (path, version). Re-registering the
/// same (path, version) overwrites the stored content.
pub async fn register(
    pool: &DbPool,
    ids: &Snowflake,
    path: &str,
    version: &str,
    content: serde_json::Value,
) -> Result<CatalogRow, DbError> {
    let id = ids.next_id();
    let now = Utc::now();

    let row = sqlx::query_as::<_, CatalogRow>(
        r#"
        INSERT INTO noetl.catalog (id, path, version, content, created_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (path, version) DO UPDATE SET content = EXCLUDED.content
        RETURNING id, path, version, content, created_at
        "#,
    )
    .bind(id)
    .bind(path)
    .bind(version)
    .bind(content)
    .bind(now)
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Look up a playbook by exact (path, version).
pub async fn get_by_path_version(
    pool: &DbPool,
    path: &str,
    version: &str,
) -> Result<CatalogRow, DbError> {
    sqlx::query_as::<_, CatalogRow>(
        r#"
        SELECT id, path, version, content, created_at
        FROM noetl.catalog
        WHERE path = $1 AND version = $2
        "#,
    )
    .bind(path)
    .bind(version)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)
}

/// Look up the most recently registered version for a path.
pub async fn get_latest(pool: &DbPool, path: &str) -> Result<CatalogRow, DbError> {
    sqlx::query_as::<_, CatalogRow>(
        r#"
        SELECT id, path, version, content, created_at
        FROM noetl.catalog
        WHERE path = $1
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(path)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)
}

/// Look up a playbook by its catalog id.
pub async fn get_by_id(pool: &DbPool, id: i64) -> Result<CatalogRow, DbError> {
    sqlx::query_as::<_, CatalogRow>(
        r#"SELECT id, path, version, content, created_at FROM noetl.catalog WHERE id = $1"#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)
}
