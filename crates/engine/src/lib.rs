//! `engine` crate — playbook domain model, DAG validation, execution state
//! folding, and the broker (spec §4.5).

pub mod broker;
pub mod dag;
pub mod error;
pub mod models;
pub mod state;

pub use broker::{parse_playbook, Broker, ParentRef};
pub use dag::validate_dag;
pub use error::EngineError;
pub use models::{LoopMode, LoopSpec, NextEntry, OnError, Playbook, PlaybookRef, SinkSpec, Step, TransitionTarget};
pub use state::{ExecutionState, StepInfo, StepState, WorkflowState};
