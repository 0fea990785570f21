//! Repository functions — one module per table, one function per operation.
//!
//! Every function takes a `&DbPool` and returns a `Result<T, DbError>`.
//! No business logic, no domain types — pure SQL.

pub mod catalog;
pub mod error_log;
pub mod events;
pub mod workload;

// Queue-table mutations (enqueue/lease/heartbeat/complete/fail/reclaim) live
// in the `queue` crate, which owns the task-queue contract end to end; this
// crate only exposes `models::QueueTaskRow` and `DbPool` for it to build on.
