//! End-to-end ingestion scenarios.
//!
//! Every orchestrator here runs against file-backed SQLite stores, so two
//! orchestrators opened on the same file behave like two service instances.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use ticketsync_core::{
    create_notify_system,
    testing::{fixtures, MockNotifier, MockTicketSource},
    AuditFilter, AuditLogger, CircuitBreaker, CircuitBreakerConfig, IngestConfig,
    IngestionOrchestrator, JobStatus, JobTracker, KeywordClassifier, LockManager, NotifyConfig,
    OrchestratorError, OrchestratorParts, PageFetcher, RateLimitConfig, SqliteAuditStore,
    SqliteJobTracker, SqliteLockManager, SqliteTicketStore, TicketFilter, TicketStore,
    TokenBucketLimiter,
};

const PAGE_SIZE: u32 = 2;

/// One service instance wired to a shared database file.
struct Instance {
    orchestrator: IngestionOrchestrator,
    tickets: Arc<SqliteTicketStore>,
    notifier: Arc<MockNotifier>,
}

fn instance(db_path: &Path, source: Arc<MockTicketSource>, rate_limit: RateLimitConfig) -> Instance {
    let tickets = Arc::new(SqliteTicketStore::new(db_path).expect("ticket store"));
    let notifier = Arc::new(MockNotifier::new());
    let limiter = Arc::new(TokenBucketLimiter::new(&rate_limit));
    let breaker = Arc::new(CircuitBreaker::new("notify", CircuitBreakerConfig::default()));
    let (dispatcher, worker) =
        create_notify_system(notifier.clone(), breaker.clone(), &NotifyConfig::default());
    tokio::spawn(worker.run());

    let config = IngestConfig::default();
    let fetcher = PageFetcher::new(
        source,
        limiter.clone(),
        config.fetch_policy(Duration::from_secs(10)),
        PAGE_SIZE,
    );
    let parts = OrchestratorParts {
        locks: Arc::new(SqliteLockManager::new(db_path).expect("lock manager")),
        jobs: Arc::new(SqliteJobTracker::new(db_path).expect("job tracker")),
        tickets: tickets.clone(),
        classifier: Arc::new(KeywordClassifier::new().expect("classifier")),
        fetcher,
        limiter,
        breaker,
        notifier: dispatcher,
        audit: AuditLogger::new(Arc::new(SqliteAuditStore::new(db_path).expect("audit store"))),
    };

    Instance {
        orchestrator: IngestionOrchestrator::new(config, parts),
        tickets,
        notifier,
    }
}

fn fast() -> RateLimitConfig {
    RateLimitConfig {
        requests_per_minute: 6000,
        burst: 100,
    }
}

fn acme_dataset() -> Vec<ticketsync_core::ExternalTicket> {
    fixtures::external_tickets(6)
}

#[tokio::test]
async fn test_full_ingest_then_idempotent_rerun() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(MockTicketSource::new());
    source.set_tickets("acme", acme_dataset());
    let node = instance(&dir.path().join("ticketsync.db"), source.clone(), fast());

    let first = node.orchestrator.run("acme").unwrap().wait().await.unwrap();
    assert_eq!(first.final_status, JobStatus::Completed);
    assert_eq!(first.pages_fetched, 3);
    assert_eq!(first.tickets_upserted, 6);
    assert_eq!(node.tickets.count(&TicketFilter::new().with_tenant("acme")).unwrap(), 6);
    let history_before = node.tickets.history_count("acme").unwrap();

    let second = node.orchestrator.run("acme").unwrap().wait().await.unwrap();
    assert_eq!(second.final_status, JobStatus::Completed);
    assert_eq!(second.pages_fetched, 3);
    assert_eq!(second.tickets_upserted, 0);
    assert_eq!(second.tickets_soft_deleted, 0);
    assert_eq!(second.tickets_unchanged, 6);
    assert_eq!(node.tickets.count(&TicketFilter::new().with_tenant("acme")).unwrap(), 6);
    assert_eq!(node.tickets.history_count("acme").unwrap(), history_before);

    let entries = node
        .orchestrator
        .audit_entries(&AuditFilter::new().with_tenant("acme"))
        .unwrap();
    assert_eq!(entries.len(), 2);
}

#[tokio::test]
async fn test_advanced_updated_at_writes_one_history_row_per_changed_field() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(MockTicketSource::new());
    source.set_tickets("acme", acme_dataset());
    let node = instance(&dir.path().join("ticketsync.db"), source.clone(), fast());
    node.orchestrator.run("acme").unwrap().wait().await.unwrap();
    let history_before = node.tickets.history_count("acme").unwrap();

    let original = acme_dataset().remove(2);
    source.upsert_ticket("acme", fixtures::modified(&original, 2, "closed"));

    let entry = node.orchestrator.run("acme").unwrap().wait().await.unwrap();
    assert_eq!(entry.tickets_upserted, 1);
    assert_eq!(entry.tickets_unchanged, 5);
    assert_eq!(node.tickets.history_count("acme").unwrap(), history_before + 1);

    let history = node.orchestrator.ticket_history("acme", &original.id, 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].field, "status");
    assert_eq!(history[0].old_value.as_deref(), Some("open"));
    assert_eq!(history[0].new_value.as_deref(), Some("closed"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_runs_for_one_tenant_yield_a_single_job() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("ticketsync.db");
    let source = Arc::new(MockTicketSource::new());
    source.set_tickets("acme", acme_dataset());
    source.set_delay(Duration::from_millis(200));

    // Five instances sharing one database, all asking at once.
    let nodes: Vec<Instance> = (0..5)
        .map(|_| instance(&db_path, source.clone(), fast()))
        .collect();
    let attempts = nodes.iter().map(|node| {
        let orchestrator = node.orchestrator.clone();
        tokio::spawn(async move { orchestrator.run("acme") })
    });
    let results: Vec<_> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(OrchestratorError::Conflict { .. })))
        .count();
    assert_eq!(conflicts, 4);

    let handle = results
        .into_iter()
        .find_map(|r| r.ok())
        .expect("one run must be accepted");
    let status = nodes[0].orchestrator.ingestion_status("acme").unwrap();
    assert!(status.running);
    assert_eq!(status.job.unwrap().job_id, handle.job_id);

    let entry = handle.wait().await.unwrap();
    assert_eq!(entry.final_status, JobStatus::Completed);

    // Only the accepted run left an audit trail.
    let entries = nodes[1]
        .orchestrator
        .audit_entries(&AuditFilter::new().with_tenant("acme"))
        .unwrap();
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn test_different_tenants_run_side_by_side() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(MockTicketSource::new());
    source.set_tickets("acme", acme_dataset());
    source.set_tickets("globex", fixtures::external_tickets(3));
    let node = instance(&dir.path().join("ticketsync.db"), source.clone(), fast());

    let acme = node.orchestrator.run("acme").unwrap();
    let globex = node.orchestrator.run("globex").unwrap();

    assert_eq!(acme.wait().await.unwrap().tickets_upserted, 6);
    assert_eq!(globex.wait().await.unwrap().tickets_upserted, 3);
    assert_eq!(
        node.tickets.count(&TicketFilter::new().with_tenant("globex")).unwrap(),
        3
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_keeps_pages_already_persisted() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(MockTicketSource::new());
    source.set_tickets("acme", acme_dataset());
    source.set_delay(Duration::from_secs(1));
    let node = instance(
        &dir.path().join("ticketsync.db"),
        source.clone(),
        RateLimitConfig::default(),
    );

    let handle = node.orchestrator.run("acme").unwrap();
    let job_id = handle.job_id.clone();

    while node.orchestrator.get_job_status(&job_id).unwrap().processed_pages < 1 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(node.orchestrator.cancel(&job_id).unwrap(), JobStatus::Cancelled);

    let entry = handle.wait().await.unwrap();
    assert_eq!(entry.final_status, JobStatus::Cancelled);
    assert_eq!(entry.pages_fetched, 2);
    assert_eq!(entry.tickets_upserted, 4);
    assert!(entry.error_summary.is_none());

    let job = node.orchestrator.get_job_status(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.processed_pages, 2);
    assert_eq!(node.tickets.count(&TicketFilter::new().with_tenant("acme")).unwrap(), 4);
    // a cancelled run never reconciles deletions
    assert_eq!(
        node.tickets
            .count(&TicketFilter::new().with_tenant("acme").including_deleted())
            .unwrap(),
        4
    );
    assert!(node.orchestrator.lock_status("acme").unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_on_page_two_pauses_the_run() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(MockTicketSource::new());
    source.set_tickets("acme", acme_dataset());
    source.rate_limit_once(2, Duration::from_secs(5));
    let node = instance(
        &dir.path().join("ticketsync.db"),
        source.clone(),
        RateLimitConfig::default(),
    );

    let entry = node.orchestrator.run("acme").unwrap().wait().await.unwrap();
    assert_eq!(entry.final_status, JobStatus::Completed);
    assert_eq!(entry.tickets_upserted, 6);

    let page_two: Vec<_> = source
        .fetches()
        .into_iter()
        .filter(|f| f.page == 2)
        .map(|f| f.at)
        .collect();
    assert_eq!(page_two.len(), 2);
    assert!(page_two[1] - page_two[0] >= Duration::from_secs(5));
}

#[tokio::test]
async fn test_abandoned_lock_is_reclaimed_after_ttl() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("ticketsync.db");
    let source = Arc::new(MockTicketSource::new());
    source.set_tickets("acme", acme_dataset());

    // A crashed instance left its lock behind and never released it.
    let crashed = SqliteLockManager::new(&db_path).unwrap();
    assert!(crashed
        .acquire("acme", "crashed-job", Duration::from_millis(200))
        .unwrap());

    let node = instance(&db_path, source, fast());
    assert!(matches!(
        node.orchestrator.run("acme"),
        Err(OrchestratorError::Conflict { .. })
    ));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let entry = node.orchestrator.run("acme").unwrap().wait().await.unwrap();
    assert_eq!(entry.final_status, JobStatus::Completed);
}

#[tokio::test]
async fn test_crashed_job_is_failed_when_its_lock_is_taken_over() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("ticketsync.db");
    let source = Arc::new(MockTicketSource::new());
    source.set_tickets("acme", acme_dataset());

    // A crashed instance left both its lock and its running job behind.
    let crashed_locks = SqliteLockManager::new(&db_path).unwrap();
    let crashed_jobs = SqliteJobTracker::new(&db_path).unwrap();
    assert!(crashed_locks
        .acquire("acme", "crashed-job", Duration::from_millis(100))
        .unwrap());
    crashed_jobs.create("crashed-job", "acme").unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let node = instance(&db_path, source, fast());
    let handle = node.orchestrator.run("acme").unwrap();

    // Only the new run is running for the tenant.
    let crashed = node.orchestrator.get_job_status("crashed-job").unwrap();
    assert_eq!(crashed.status, JobStatus::Failed);
    assert!(crashed.finished_at.is_some());
    let running = crashed_jobs.running_jobs(Some("acme")).unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].job_id, handle.job_id);
    assert!(matches!(
        node.orchestrator.cancel("crashed-job"),
        Err(OrchestratorError::AlreadyTerminal { .. })
    ));

    let entry = handle.wait().await.unwrap();
    assert_eq!(entry.final_status, JobStatus::Completed);

    let crashed_log = node
        .orchestrator
        .audit_entries(&AuditFilter::new().with_job_id("crashed-job"))
        .unwrap();
    assert_eq!(crashed_log.len(), 1);
    assert_eq!(crashed_log[0].final_status, JobStatus::Failed);
    assert!(crashed_log[0].error_summary.is_some());
}

#[tokio::test]
async fn test_startup_reaps_jobs_without_a_lock() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("ticketsync.db");
    let locks = SqliteLockManager::new(&db_path).unwrap();
    let jobs = SqliteJobTracker::new(&db_path).unwrap();

    // globex's lock expired and was cleaned up; acme's run is alive.
    jobs.create("orphan", "globex").unwrap();
    assert!(locks
        .acquire("acme", "live", Duration::from_secs(600))
        .unwrap());
    jobs.create("live", "acme").unwrap();

    let node = instance(&db_path, Arc::new(MockTicketSource::new()), fast());
    assert_eq!(node.orchestrator.reap_abandoned_jobs().unwrap(), 1);

    assert_eq!(jobs.get("orphan").unwrap().unwrap().status, JobStatus::Failed);
    assert_eq!(jobs.get("live").unwrap().unwrap().status, JobStatus::Running);
    assert_eq!(node.orchestrator.reap_abandoned_jobs().unwrap(), 0);
}

#[tokio::test]
async fn test_failed_run_is_audited_and_notifications_are_independent() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(MockTicketSource::new());
    source.set_tickets(
        "acme",
        vec![
            fixtures::external_ticket("ext-001", "We were charged twice, this is urgent"),
            fixtures::external_ticket("ext-002", "Thanks for the quick reply"),
            fixtures::external_ticket("ext-003", "Where is the invoice?"),
        ],
    );
    source.fail_permanent(2);
    let node = instance(&dir.path().join("ticketsync.db"), source, fast());

    let entry = node.orchestrator.run("acme").unwrap().wait().await.unwrap();
    assert_eq!(entry.final_status, JobStatus::Failed);
    assert_eq!(entry.pages_fetched, 1);
    assert_eq!(entry.tickets_upserted, 2);
    assert_eq!(entry.notifications_queued, 1);
    assert!(entry.error_summary.is_some());

    let failed = node
        .orchestrator
        .audit_entries(&AuditFilter::new().with_status(JobStatus::Failed))
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].job_id, entry.job_id);

    // Delivery happens in the background even though the run failed.
    for _ in 0..100 {
        if node.notifier.delivered().len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(node.notifier.delivered()[0].ticket_id, "ext-001");
}
