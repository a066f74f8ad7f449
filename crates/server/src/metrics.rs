//! Prometheus metrics for observability.
//!
//! This module provides metrics for monitoring the ticketsync server:
//! - HTTP request metrics (latency, counts)
//! - Circuit breaker and rate limiter state (collected dynamically)
//! - Everything the core exports through `ticketsync_core::metrics`

use once_cell::sync::Lazy;
use prometheus::{
    self, Encoder, Gauge, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use ticketsync_core::CircuitState;

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// HTTP Request Metrics
// =============================================================================

/// HTTP request duration in seconds.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "ticketsync_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ]),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests total count.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticketsync_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests currently in flight.
pub static HTTP_REQUESTS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "ticketsync_http_requests_in_flight",
        "Number of HTTP requests currently being processed",
    )
    .unwrap()
});

// =============================================================================
// Control plane state (collected dynamically)
// =============================================================================

/// Notification circuit state: 0 = closed, 1 = open, 2 = half-open.
pub static CIRCUIT_STATE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "ticketsync_circuit_state",
        "Notification circuit breaker state (0 closed, 1 open, 2 half-open)",
    )
    .unwrap()
});

/// Tokens currently available in the outbound rate limiter.
pub static RATE_LIMIT_TOKENS: Lazy<Gauge> = Lazy::new(|| {
    Gauge::new(
        "ticketsync_rate_limit_tokens_available",
        "Tokens available in the outbound rate limiter",
    )
    .unwrap()
});

/// Notifications waiting in the dispatch queue.
pub static NOTIFY_QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "ticketsync_notify_queue_depth",
        "Notifications queued but not yet delivered, failed or rejected",
    )
    .unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    // HTTP
    registry
        .register(Box::new(HTTP_REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_IN_FLIGHT.clone()))
        .unwrap();

    // Control plane
    registry.register(Box::new(CIRCUIT_STATE.clone())).unwrap();
    registry
        .register(Box::new(RATE_LIMIT_TOKENS.clone()))
        .unwrap();
    registry
        .register(Box::new(NOTIFY_QUEUE_DEPTH.clone()))
        .unwrap();

    // Core metrics (ingestion, fetches, notifications)
    for metric in ticketsync_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Collect dynamic metrics from current application state.
///
/// Called before encoding so the gauges reflect the live singletons.
pub async fn collect_dynamic_metrics(state: &crate::state::AppState) {
    let orchestrator = state.orchestrator();

    let circuit = orchestrator.circuit_status();
    CIRCUIT_STATE.set(match circuit.state {
        CircuitState::Closed => 0,
        CircuitState::Open => 1,
        CircuitState::HalfOpen => 2,
    });

    let limiter = orchestrator.rate_limit_status().await;
    RATE_LIMIT_TOKENS.set(limiter.tokens_available);

    let notify = orchestrator.notify_stats();
    let settled = notify.delivered + notify.failed + notify.rejected;
    NOTIFY_QUEUE_DEPTH.set(notify.queued.saturating_sub(settled) as i64);
}

/// Normalize a path for metric labels (replace IDs with placeholders).
pub fn normalize_path(path: &str) -> String {
    static UUID: Lazy<regex_lite::Regex> = Lazy::new(|| {
        regex_lite::Regex::new(
            r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
        )
        .unwrap()
    });
    static TICKET_ID: Lazy<regex_lite::Regex> =
        Lazy::new(|| regex_lite::Regex::new(r"/tickets/[^/]+/history").unwrap());
    static TICKET: Lazy<regex_lite::Regex> =
        Lazy::new(|| regex_lite::Regex::new(r"/tickets/[^/]+$").unwrap());
    static LOCK_TENANT: Lazy<regex_lite::Regex> =
        Lazy::new(|| regex_lite::Regex::new(r"/ingest/lock/[^/]+$").unwrap());

    let result = UUID.replace_all(path, "{id}");
    let result = TICKET_ID.replace_all(&result, "/tickets/{external_id}/history");
    let result = LOCK_TENANT.replace_all(&result, "/ingest/lock/{tenant_id}");
    if result.ends_with("/tickets/urgent") {
        return result.to_string();
    }
    TICKET.replace_all(&result, "/tickets/{external_id}").to_string()
}
