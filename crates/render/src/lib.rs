//! `render` crate — the context/template renderer (spec §4.3).

pub mod context;
pub mod diagnostics;
pub mod error;
pub mod policy;
pub mod renderer;

pub use context::{build_context, IterationScope};
pub use diagnostics::log_failure;
pub use error::RenderError;
pub use policy::UndefinedPolicy;
pub use renderer::{eval_bool, eval_value, maybe_parse_json, render_step_inputs, render_tree};
