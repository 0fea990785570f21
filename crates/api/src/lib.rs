//! `api` crate — HTTP REST surface over the broker, queue, and event log
//! (spec §6).
//!
//! Exposes:
//!   POST /executions/run   — submit a playbook for execution
//!   POST /execute          — alias of the above
//!   POST /events           — append an event, triggering broker evaluation
//!   GET  /events           — query events
//!   POST /queue/lease
//!   POST /queue/:id/complete
//!   POST /queue/:id/fail
//!   POST /queue/:id/heartbeat
//!   GET  /queue

pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use db::DbPool;
use engine::Broker;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub broker: Arc<Broker>,
    pub lease_seconds: i64,
}

pub async fn serve(bind: &str, pool: DbPool, broker: Arc<Broker>, lease_seconds: i64) -> Result<(), std::io::Error> {
    let state = AppState { pool, broker, lease_seconds };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/executions/run", post(handlers::executions::run))
        .route("/execute", post(handlers::executions::run))
        .route("/events", post(handlers::events::append).get(handlers::events::list))
        .route("/queue/lease", post(handlers::queue::lease))
        .route("/queue/:id/complete", post(handlers::queue::complete))
        .route("/queue/:id/fail", post(handlers::queue::fail))
        .route("/queue/:id/heartbeat", post(handlers::queue::heartbeat))
        .route("/queue", get(handlers::queue::list))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await
}
