//! Assembly of the long-lived service components from configuration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use ticketsync_core::{
    create_notify_system, AuditLogger, CircuitBreaker, Config, HttpNotifier, HttpTicketSource,
    IngestionOrchestrator, KeywordClassifier, LockManager, LogNotifier, Notifier, NotifyWorker,
    OrchestratorParts, PageFetcher, SqliteAuditStore, SqliteJobTracker, SqliteLockManager,
    SqliteTicketStore, TokenBucketLimiter,
};

/// Name of the breaker guarding notification delivery.
pub const NOTIFY_CIRCUIT: &str = "notify";

/// The orchestrator plus the notification worker that must be spawned
/// next to it.
pub struct Service {
    pub orchestrator: IngestionOrchestrator,
    pub notify_worker: NotifyWorker,
}

/// Build every store and process-wide singleton exactly once.
///
/// All stores open the same database file; it is created if missing.
pub fn build_service(config: &Config) -> Result<Service> {
    let db_path = &config.database.path;

    let locks = Arc::new(SqliteLockManager::new(db_path).context("Failed to create lock store")?);
    let jobs = Arc::new(SqliteJobTracker::new(db_path).context("Failed to create job store")?);
    let tickets =
        Arc::new(SqliteTicketStore::new(db_path).context("Failed to create ticket store")?);
    let audit_store =
        Arc::new(SqliteAuditStore::new(db_path).context("Failed to create audit store")?);
    info!("Stores initialized at {:?}", db_path);

    // Locks abandoned by a crashed process would otherwise linger until the
    // next acquire for that tenant.
    let stale = locks
        .cleanup_expired()
        .context("Failed to clean up expired locks")?;
    if stale > 0 {
        info!(count = stale, "Removed expired tenant locks");
    }

    let source = Arc::new(
        HttpTicketSource::new(&config.source).context("Failed to create ticket source client")?,
    );
    info!("Ticket source: {}", config.source.base_url);

    let notifier: Arc<dyn Notifier> = match &config.notify.url {
        Some(url) => {
            info!("Notifications delivered to {}", url);
            Arc::new(
                HttpNotifier::new(url, Duration::from_secs(config.notify.timeout_secs))
                    .context("Failed to create notification client")?,
            )
        }
        None => {
            info!("No notify URL configured, notifications are only logged");
            Arc::new(LogNotifier)
        }
    };

    let limiter = Arc::new(TokenBucketLimiter::new(&config.rate_limit));
    let breaker = Arc::new(CircuitBreaker::new(
        NOTIFY_CIRCUIT,
        config.circuit_breaker.clone(),
    ));
    let (dispatcher, notify_worker) =
        create_notify_system(notifier, Arc::clone(&breaker), &config.notify);

    let fetcher = PageFetcher::new(
        source,
        Arc::clone(&limiter),
        config
            .ingest
            .fetch_policy(Duration::from_secs(config.source.timeout_secs)),
        config.source.page_size,
    );

    let classifier =
        Arc::new(KeywordClassifier::new().context("Failed to compile classification rules")?);

    let orchestrator = IngestionOrchestrator::new(
        config.ingest.clone(),
        OrchestratorParts {
            locks,
            jobs,
            tickets,
            classifier,
            fetcher,
            limiter,
            breaker,
            notifier: dispatcher,
            audit: AuditLogger::new(audit_store),
        },
    );

    let reaped = orchestrator
        .reap_abandoned_jobs()
        .context("Failed to reap abandoned jobs")?;
    if reaped > 0 {
        info!(count = reaped, "Marked jobs of crashed runs as failed");
    }

    Ok(Service {
        orchestrator,
        notify_worker,
    })
}
