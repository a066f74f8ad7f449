//! Ingestion orchestrator implementation.
//!
//! One run per tenant at a time, enforced by the durable tenant lock. The
//! run itself is a spawned task; callers get the job id back immediately.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditFilter, AuditLogger, IngestionLogEntry};
use crate::circuit_breaker::{CircuitBreaker, CircuitStatus};
use crate::classify::Classifier;
use crate::job::{Job, JobError, JobStatus, JobTracker};
use crate::lock::{LockManager, LockStatus};
use crate::metrics;
use crate::notify::{DispatchStatsSnapshot, Notification, NotifyDispatcher};
use crate::rate_limiter::{RateLimitStatus, TokenBucketLimiter};
use crate::source::PageFetcher;
use crate::sync::{ChangeSync, SyncOutcome};
use crate::ticket::{Ticket, TicketFilter, TicketHistoryEntry, TicketStore};

use super::config::IngestConfig;
use super::types::{IngestionStatus, OrchestratorError, RunHandle};

/// Collaborators the orchestrator is assembled from.
pub struct OrchestratorParts {
    pub locks: Arc<dyn LockManager>,
    pub jobs: Arc<dyn JobTracker>,
    pub tickets: Arc<dyn TicketStore>,
    pub classifier: Arc<dyn Classifier>,
    pub fetcher: PageFetcher,
    pub limiter: Arc<TokenBucketLimiter>,
    pub breaker: Arc<CircuitBreaker>,
    pub notifier: NotifyDispatcher,
    pub audit: AuditLogger,
}

/// Drives ingestion runs and answers questions about them.
#[derive(Clone)]
pub struct IngestionOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: IngestConfig,
    locks: Arc<dyn LockManager>,
    jobs: Arc<dyn JobTracker>,
    tickets: Arc<dyn TicketStore>,
    sync: ChangeSync,
    fetcher: PageFetcher,
    limiter: Arc<TokenBucketLimiter>,
    breaker: Arc<CircuitBreaker>,
    notifier: NotifyDispatcher,
    audit: AuditLogger,
}

/// Counters accumulated over one run.
#[derive(Debug, Default)]
struct RunProgress {
    pages_fetched: u64,
    tickets_upserted: u64,
    tickets_soft_deleted: u64,
    tickets_unchanged: u64,
    notifications_queued: u64,
    notifications_dropped: u64,
}

impl RunProgress {
    fn absorb(&mut self, outcome: &SyncOutcome) {
        self.tickets_upserted += outcome.upserted();
        self.tickets_soft_deleted += outcome.soft_deleted;
        self.tickets_unchanged += outcome.unchanged;
    }
}

const ABANDONED_SUMMARY: &str = "run abandoned: lock expired before the job finished";

/// How the page loop ended when it did not fail.
enum RunEnd {
    Exhausted,
    Cancelled,
}

impl IngestionOrchestrator {
    pub fn new(config: IngestConfig, parts: OrchestratorParts) -> Self {
        let sync = ChangeSync::new(Arc::clone(&parts.tickets), parts.classifier);
        Self {
            inner: Arc::new(Inner {
                config,
                locks: parts.locks,
                jobs: parts.jobs,
                tickets: parts.tickets,
                sync,
                fetcher: parts.fetcher,
                limiter: parts.limiter,
                breaker: parts.breaker,
                notifier: parts.notifier,
                audit: parts.audit,
            }),
        }
    }

    /// Start an ingestion run for `tenant_id`.
    ///
    /// Fails with [`OrchestratorError::Conflict`] when another run holds the
    /// tenant lock; in that case no job is created.
    pub fn run(&self, tenant_id: &str) -> Result<RunHandle, OrchestratorError> {
        let inner = &self.inner;
        let job_id = Uuid::new_v4().to_string();

        if !inner
            .locks
            .acquire(tenant_id, &job_id, inner.config.lock_ttl())?
        {
            metrics::LOCK_CONFLICTS.inc();
            warn!(tenant_id, "Ingestion already running, rejecting run");
            return Err(OrchestratorError::Conflict {
                tenant_id: tenant_id.to_string(),
            });
        }

        // We hold the lock, so any job still running for this tenant belongs
        // to a run that died without releasing it.
        let job = match inner
            .fail_stale_jobs(tenant_id)
            .and_then(|_| inner.jobs.create(&job_id, tenant_id))
        {
            Ok(job) => job,
            Err(e) => {
                error!(tenant_id, job_id = %job_id, "Failed to create job: {}", e);
                if let Err(e) = inner.locks.release(tenant_id, &job_id) {
                    error!(tenant_id, "Failed to release lock: {}", e);
                }
                return Err(e.into());
            }
        };

        info!(tenant_id, job_id = %job_id, "Ingestion run started");

        let task = tokio::spawn(Arc::clone(inner).execute(job.tenant_id, job.job_id, job.created_at));
        Ok(RunHandle::new(job_id, task))
    }

    /// Fail every running job whose tenant lock is gone or owned by another
    /// job. Used at startup, after expired locks have been cleaned up.
    pub fn reap_abandoned_jobs(&self) -> Result<usize, OrchestratorError> {
        let mut reaped = 0;
        for job in self.inner.jobs.running_jobs(None)? {
            let held = self
                .inner
                .locks
                .status(&job.tenant_id)?
                .is_some_and(|lock| lock.owner == job.job_id);
            if !held && self.inner.abandon(&job) {
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    pub fn get_job_status(&self, job_id: &str) -> Result<Job, OrchestratorError> {
        self.inner
            .jobs
            .get(job_id)?
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))
    }

    /// Ask a running job to stop after its current page.
    ///
    /// Answers `cancelled` as soon as the request is recorded; the stored
    /// status follows once the run observes the flag.
    pub fn cancel(&self, job_id: &str) -> Result<JobStatus, OrchestratorError> {
        self.inner.jobs.request_cancellation(job_id)?;
        info!(job_id, "Cancellation requested");
        Ok(JobStatus::Cancelled)
    }

    pub fn ingestion_status(&self, tenant_id: &str) -> Result<IngestionStatus, OrchestratorError> {
        let job = self.inner.jobs.running_for_tenant(tenant_id)?;
        let lock = self.inner.locks.status(tenant_id)?;
        Ok(IngestionStatus {
            tenant_id: tenant_id.to_string(),
            running: job.is_some(),
            job,
            lock,
        })
    }

    pub fn lock_status(&self, tenant_id: &str) -> Result<Option<LockStatus>, OrchestratorError> {
        Ok(self.inner.locks.status(tenant_id)?)
    }

    pub fn circuit_status(&self) -> CircuitStatus {
        self.inner.breaker.status()
    }

    pub fn reset_circuit(&self) -> CircuitStatus {
        self.inner.breaker.reset();
        self.inner.breaker.status()
    }

    pub async fn rate_limit_status(&self) -> RateLimitStatus {
        self.inner.limiter.status().await
    }

    pub fn notify_stats(&self) -> DispatchStatsSnapshot {
        self.inner.notifier.stats()
    }

    /// Live tickets matching `filter`; soft-deleted ones only when requested.
    pub fn list_tickets(&self, filter: &TicketFilter) -> Result<Vec<Ticket>, OrchestratorError> {
        Ok(self.inner.tickets.list(filter)?)
    }

    /// One ticket by its source id, soft-deleted or not.
    pub fn get_ticket(
        &self,
        tenant_id: &str,
        external_id: &str,
    ) -> Result<Option<Ticket>, OrchestratorError> {
        Ok(self.inner.tickets.get(tenant_id, external_id)?)
    }

    pub fn count_tickets(&self, filter: &TicketFilter) -> Result<i64, OrchestratorError> {
        Ok(self.inner.tickets.count(filter)?)
    }

    pub fn ticket_history(
        &self,
        tenant_id: &str,
        external_id: &str,
        limit: i64,
    ) -> Result<Vec<TicketHistoryEntry>, OrchestratorError> {
        Ok(self.inner.tickets.history(tenant_id, external_id, limit)?)
    }

    pub fn audit_entries(
        &self,
        filter: &AuditFilter,
    ) -> Result<Vec<IngestionLogEntry>, OrchestratorError> {
        Ok(self.inner.audit.entries(filter)?)
    }

    /// Number of audit entries matching `filter`, ignoring its pagination.
    pub fn audit_count(&self, filter: &AuditFilter) -> Result<i64, OrchestratorError> {
        Ok(self.inner.audit.count(filter)?)
    }

    /// Run a cheap read against the ticket, job and audit tables.
    pub fn check_storage(&self) -> Result<(), OrchestratorError> {
        self.inner.tickets.count(&TicketFilter::new())?;
        self.inner.jobs.running_jobs(None)?;
        self.inner.audit.count(&AuditFilter::new())?;
        Ok(())
    }
}

impl Inner {
    /// Body of the spawned run task. Never fails: every outcome ends in a
    /// terminal job, a released lock and one audit entry.
    async fn execute(
        self: Arc<Self>,
        tenant_id: String,
        job_id: String,
        started_at: DateTime<Utc>,
    ) -> IngestionLogEntry {
        let timer = Instant::now();
        let lock_lost = Arc::new(AtomicBool::new(false));
        let heartbeat = self.spawn_heartbeat(&tenant_id, &job_id, Arc::clone(&lock_lost));

        let mut progress = RunProgress::default();
        let result = AssertUnwindSafe(self.drive(&tenant_id, &job_id, &lock_lost, &mut progress))
            .catch_unwind()
            .await;
        heartbeat.abort();

        let (status, error_summary) = match result {
            Ok(Ok(RunEnd::Exhausted)) => (JobStatus::Completed, None),
            Ok(Ok(RunEnd::Cancelled)) => (JobStatus::Cancelled, None),
            Ok(Err(e)) => (JobStatus::Failed, Some(e.to_string())),
            Err(panic) => (JobStatus::Failed, Some(panic_message(panic.as_ref()))),
        };

        let final_status = self.finalize(&job_id, status);

        if let Err(e) = self.locks.release(&tenant_id, &job_id) {
            error!(tenant_id = %tenant_id, job_id = %job_id, "Failed to release lock: {}", e);
        }

        let entry = IngestionLogEntry {
            id: 0,
            job_id,
            tenant_id,
            started_at,
            finished_at: Utc::now(),
            final_status,
            pages_fetched: progress.pages_fetched,
            tickets_upserted: progress.tickets_upserted,
            tickets_soft_deleted: progress.tickets_soft_deleted,
            tickets_unchanged: progress.tickets_unchanged,
            notifications_queued: progress.notifications_queued,
            notifications_dropped: progress.notifications_dropped,
            error_summary,
        };
        let id = self.audit.record(&entry).unwrap_or(0);

        let elapsed = timer.elapsed().as_secs_f64();
        metrics::INGESTION_RUNS
            .with_label_values(&[final_status.as_str()])
            .inc();
        metrics::INGESTION_DURATION
            .with_label_values(&[final_status.as_str()])
            .observe(elapsed);

        match &entry.error_summary {
            Some(err) => warn!(
                tenant_id = %entry.tenant_id,
                job_id = %entry.job_id,
                pages = entry.pages_fetched,
                "Ingestion run failed: {}",
                err
            ),
            None => info!(
                tenant_id = %entry.tenant_id,
                job_id = %entry.job_id,
                status = %final_status,
                pages = entry.pages_fetched,
                upserted = entry.tickets_upserted,
                unchanged = entry.tickets_unchanged,
                soft_deleted = entry.tickets_soft_deleted,
                "Ingestion run finished in {:.1}s",
                elapsed
            ),
        }

        IngestionLogEntry { id, ..entry }
    }

    /// The page loop. Everything written before an error stays written.
    async fn drive(
        &self,
        tenant_id: &str,
        job_id: &str,
        lock_lost: &AtomicBool,
        progress: &mut RunProgress,
    ) -> Result<RunEnd, OrchestratorError> {
        let mut page = 1u32;
        let mut seen = HashSet::new();

        loop {
            ensure_lock_held(tenant_id, lock_lost)?;

            let fetched = self.fetcher.fetch_page(tenant_id, page).await?;
            if fetched.items.is_empty() {
                debug!(tenant_id, job_id, page, "Empty page, end of data");
                break;
            }

            let outcome = self.sync.apply_page(tenant_id, &fetched.items)?;
            progress.pages_fetched += 1;
            progress.absorb(&outcome);
            metrics::PAGES_FETCHED.inc();

            for ticket in &outcome.notify {
                if self.notifier.try_dispatch(Notification::for_ticket(ticket)) {
                    progress.notifications_queued += 1;
                } else {
                    progress.notifications_dropped += 1;
                }
            }
            seen.extend(outcome.seen_ids);

            self.jobs.update_progress(
                job_id,
                progress.pages_fetched as u32,
                fetched.total_pages_estimate(self.fetcher.page_size()),
            )?;
            debug!(
                tenant_id,
                job_id,
                page,
                inserted = outcome.inserted,
                updated = outcome.updated,
                unchanged = outcome.unchanged,
                "Page applied"
            );

            if self.jobs.is_cancellation_requested(job_id)? {
                info!(tenant_id, job_id, page, "Cancellation observed, stopping run");
                return Ok(RunEnd::Cancelled);
            }

            match fetched.next_page {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }

        // A cancel can land while the final, empty page is in flight.
        if self.jobs.is_cancellation_requested(job_id)? {
            info!(
                tenant_id,
                job_id, page, "Cancellation observed at end of data, skipping reconcile"
            );
            return Ok(RunEnd::Cancelled);
        }

        if self.config.reconcile_deletions {
            ensure_lock_held(tenant_id, lock_lost)?;
            let missing = self.sync.detect_deleted(tenant_id, &seen)?;
            if !missing.is_empty() {
                let deleted = self.sync.mark_deleted(tenant_id, &missing)?;
                progress.tickets_soft_deleted += deleted;
                info!(tenant_id, job_id, deleted, "Soft-deleted tickets missing from source");
            }
        }

        Ok(RunEnd::Exhausted)
    }

    fn fail_stale_jobs(&self, tenant_id: &str) -> Result<usize, JobError> {
        let stale = self.jobs.running_jobs(Some(tenant_id))?;
        Ok(stale.iter().filter(|job| self.abandon(job)).count())
    }

    /// Finalize a job whose run is gone as failed and give it its audit
    /// entry. Returns `false` if the job had already reached a terminal state.
    fn abandon(&self, job: &Job) -> bool {
        match self.jobs.finalize(&job.job_id, JobStatus::Failed) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                error!(job_id = %job.job_id, "Failed to finalize abandoned job: {}", e);
                return false;
            }
        }

        warn!(
            tenant_id = %job.tenant_id,
            job_id = %job.job_id,
            "Run ended without releasing its lock, job marked failed"
        );
        metrics::INGESTION_RUNS
            .with_label_values(&[JobStatus::Failed.as_str()])
            .inc();
        self.audit.record(&IngestionLogEntry {
            id: 0,
            job_id: job.job_id.clone(),
            tenant_id: job.tenant_id.clone(),
            started_at: job.created_at,
            finished_at: Utc::now(),
            final_status: JobStatus::Failed,
            pages_fetched: u64::from(job.processed_pages),
            tickets_upserted: 0,
            tickets_soft_deleted: 0,
            tickets_unchanged: 0,
            notifications_queued: 0,
            notifications_dropped: 0,
            error_summary: Some(ABANDONED_SUMMARY.to_string()),
        });
        true
    }

    /// Move the job to `status`, or report the terminal status it already has.
    fn finalize(&self, job_id: &str, status: JobStatus) -> JobStatus {
        match self.jobs.finalize(job_id, status) {
            Ok(true) => status,
            Ok(false) => match self.jobs.get(job_id) {
                Ok(Some(job)) => job.status,
                _ => status,
            },
            Err(e) => {
                error!(job_id, "Failed to finalize job: {}", e);
                status
            }
        }
    }

    /// Periodically extend the tenant lock. Sets `lock_lost` and stops if
    /// the lock is no longer ours.
    fn spawn_heartbeat(
        self: &Arc<Self>,
        tenant_id: &str,
        job_id: &str,
        lock_lost: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        let tenant_id = tenant_id.to_string();
        let job_id = job_id.to_string();
        let period = inner
            .config
            .lock_refresh_interval()
            .max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match inner
                    .locks
                    .refresh(&tenant_id, &job_id, inner.config.lock_ttl())
                {
                    Ok(true) => debug!(tenant_id = %tenant_id, job_id = %job_id, "Lock refreshed"),
                    Ok(false) => {
                        warn!(tenant_id = %tenant_id, job_id = %job_id, "Lock lost, run will stop");
                        lock_lost.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(e) => {
                        warn!(tenant_id = %tenant_id, job_id = %job_id, "Failed to refresh lock: {}", e)
                    }
                }
            }
        })
    }
}

fn ensure_lock_held(tenant_id: &str, lock_lost: &AtomicBool) -> Result<(), OrchestratorError> {
    if lock_lost.load(Ordering::SeqCst) {
        return Err(OrchestratorError::LockLost {
            tenant_id: tenant_id.to_string(),
        });
    }
    Ok(())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("run panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("run panicked: {msg}")
    } else {
        "run panicked".to_string()
    }
}
