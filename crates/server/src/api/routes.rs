use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

use super::{circuit, handlers, ingest, tickets};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // API routes
    let api_routes = Router::new()
        // Health and config
        .route("/health", get(handlers::health))
        .route("/config", get(handlers::get_config))
        // Ingestion
        .route("/ingest/run", post(ingest::run_ingestion))
        .route("/ingest/status", get(ingest::get_status))
        .route("/ingest/progress/{job_id}", get(ingest::get_progress))
        .route("/ingest/lock/{tenant_id}", get(ingest::get_lock))
        .route("/ingest/logs", get(ingest::get_logs))
        .route("/ingest/{job_id}", delete(ingest::cancel_job))
        // Notification circuit breaker
        .route("/circuit/status", get(circuit::get_status))
        .route("/circuit/reset", post(circuit::reset))
        // Tickets
        .route("/tickets", get(tickets::list_tickets))
        .route("/tickets/urgent", get(tickets::list_urgent))
        .route("/tickets/{external_id}", get(tickets::get_ticket))
        .route("/tickets/{external_id}/history", get(tickets::get_history))
        .with_state(Arc::clone(&state));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::metrics))
        .with_state(state)
        .layer(middleware::from_fn(super::middleware::metrics_middleware))
}
