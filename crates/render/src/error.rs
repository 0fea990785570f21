//! Typed error type for the render crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    /// spec §4.3 "Undefined variables in strict mode surface a
    /// `template_rendering` error with the offending template, the context
    /// keys available, and a stack trace".
    #[error("template rendering failed for {template:?}: {source}")]
    TemplateRendering {
        template: String,
        available_keys: Vec<String>,
        #[source]
        source: minijinja::Error,
    },

    #[error("db error: {0}")]
    Db(#[from] db::DbError),
}
