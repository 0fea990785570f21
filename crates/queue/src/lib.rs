//! `queue` crate — the durable task queue (spec §4.2).
//!
//! Multi-writer, multi-reader work queue with at-most-one-outstanding-lease
//! per task. Built directly on `db::DbPool`; the broker (`engine` crate)
//! never touches `noetl.queue` SQL directly.

pub mod error;
pub mod ops;
pub mod task;

pub use error::QueueError;
pub use ops::{complete, enqueue, fail, get, heartbeat, lease, list, reclaim};
pub use task::{NewTask, RetryDecision};

#[cfg(test)]
mod tests {
    use super::task::NewTask;

    #[test]
    fn new_task_defaults_priority_and_max_attempts() {
        let task = NewTask::new(1, 1, "node-1", "step", "cGF5bG9hZA==", serde_json::json!({}));
        assert_eq!(task.priority, 0);
        assert_eq!(task.max_attempts, 3);
    }

    #[test]
    fn builder_methods_override_defaults() {
        let task = NewTask::new(1, 1, "node-1", "step", "cGF5bG9hZA==", serde_json::json!({}))
            .with_priority(5)
            .with_max_attempts(10);
        assert_eq!(task.priority, 5);
        assert_eq!(task.max_attempts, 10);
    }
}
