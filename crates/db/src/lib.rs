//! `db` crate — pure persistence layer.
//!
//! Provides a connection pool, typed row structs, id generation, and
//! repository functions for every table in the noetl schema. No broker or
//! queue business logic lives here.

pub mod error;
pub mod ids;
pub mod models;
pub mod pool;
pub mod repository;

pub use error::DbError;
pub use ids::Snowflake;
pub use pool::DbPool;
