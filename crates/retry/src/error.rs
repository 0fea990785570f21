//! Typed error type for the retry crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("invalid retry expression {expr:?}: {source}")]
    Expression {
        expr: String,
        #[source]
        source: minijinja::Error,
    },
}
