//! `nodes` crate — the `ActionExecutor` trait and reference executors.
//!
//! Concrete executors for the real action types (http, python, postgres,
//! duckdb, secrets, workbook, playbook, iterator) are out of scope; the
//! broker's relationship to all of them is identical (enqueue + wait for
//! `action_completed`), so only the trait boundary plus mock/echo
//! executors live here.

pub mod echo;
pub mod error;
pub mod mock;
pub mod registry;
pub mod traits;

pub use echo::EchoExecutor;
pub use error::ActionError;
pub use registry::{registry_with, ExecutorRegistry};
pub use traits::{ActionContext, ActionExecutor};
