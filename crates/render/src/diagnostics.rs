//! Recording template-rendering failures to the dedicated error log
//! (spec §4.3 "these errors are recorded in a dedicated error log for
//! diagnosis", distinct from the event log).

use db::DbPool;

use crate::error::RenderError;

pub async fn log_failure(
    pool: &DbPool,
    execution_id: i64,
    node_id: Option<&str>,
    err: &RenderError,
) -> Result<(), RenderError> {
    if let RenderError::TemplateRendering {
        template,
        available_keys,
        source,
    } = err
    {
        db::repository::error_log::insert(
            pool,
            execution_id,
            node_id,
            template,
            serde_json::Value::from(available_keys.clone()),
            &source.to_string(),
        )
        .await?;
    }
    Ok(())
}
