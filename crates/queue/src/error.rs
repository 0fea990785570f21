//! Typed error type for the queue crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("db error: {0}")]
    Db(#[from] db::DbError),

    #[error("queue task {queue_id} not found")]
    NotFound { queue_id: i64 },

    #[error("worker {worker_id} does not hold the lease on queue task {queue_id}")]
    NotLeaseOwner { queue_id: i64, worker_id: String },
}
