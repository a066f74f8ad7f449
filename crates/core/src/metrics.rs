//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Ingestion runs (results, duration, pages, tickets)
//! - Outbound fetches (retries, rate limiter waits)
//! - Notifications and the circuit breaker guarding them
//! - Tenant lock contention

use once_cell::sync::Lazy;
use prometheus::{Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

// =============================================================================
// Ingestion runs
// =============================================================================

/// Finished ingestion runs by final status.
pub static INGESTION_RUNS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticketsync_ingestion_runs_total", "Total ingestion runs"),
        &["result"], // "completed", "failed", "cancelled"
    )
    .unwrap()
});

/// Ingestion run duration in seconds.
pub static INGESTION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "ticketsync_ingestion_duration_seconds",
            "Duration of ingestion runs",
        )
        .buckets(vec![0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0]),
        &["result"],
    )
    .unwrap()
});

/// Non-empty pages fetched from the source.
pub static PAGES_FETCHED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "ticketsync_pages_fetched_total",
        "Total non-empty pages fetched from the ticket source",
    )
    .unwrap()
});

/// Tickets processed by change detection.
pub static TICKETS_SYNCED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticketsync_tickets_synced_total", "Tickets processed by sync"),
        &["action"], // "inserted", "updated", "unchanged", "soft_deleted"
    )
    .unwrap()
});

/// Runs rejected because another run holds the tenant lock.
pub static LOCK_CONFLICTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "ticketsync_lock_conflicts_total",
        "Ingestion runs rejected by the tenant lock",
    )
    .unwrap()
});

// =============================================================================
// Outbound fetches
// =============================================================================

/// Fetch retries by reason.
pub static FETCH_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticketsync_fetch_retries_total", "Page fetch retries"),
        &["reason"], // "transient", "rate_limited"
    )
    .unwrap()
});

/// Time callers spent waiting for a rate limiter slot.
pub static RATE_LIMITER_WAIT_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "ticketsync_rate_limiter_wait_seconds",
            "Time spent waiting for a rate limiter slot",
        )
        .buckets(vec![0.0, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
    )
    .unwrap()
});

// =============================================================================
// Notifications
// =============================================================================

/// Notifications by result.
pub static NOTIFICATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticketsync_notifications_total", "Notifications by result"),
        &["result"], // "queued", "dropped", "delivered", "failed", "circuit_open"
    )
    .unwrap()
});

/// Circuit breaker transitions by target state.
pub static CIRCUIT_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "ticketsync_circuit_transitions_total",
            "Circuit breaker state transitions",
        ),
        &["state"], // "CLOSED", "OPEN", "HALF_OPEN"
    )
    .unwrap()
});

// =============================================================================
// Helper functions
// =============================================================================

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Ingestion
        Box::new(INGESTION_RUNS.clone()),
        Box::new(INGESTION_DURATION.clone()),
        Box::new(PAGES_FETCHED.clone()),
        Box::new(TICKETS_SYNCED.clone()),
        Box::new(LOCK_CONFLICTS.clone()),
        // Fetches
        Box::new(FETCH_RETRIES.clone()),
        Box::new(RATE_LIMITER_WAIT_SECONDS.clone()),
        // Notifications
        Box::new(NOTIFICATIONS.clone()),
        Box::new(CIRCUIT_TRANSITIONS.clone()),
    ]
}
