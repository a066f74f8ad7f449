use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use super::{Notification, Notifier, NotifyConfig, NotifyError};
use crate::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::metrics;

/// Process-lifetime delivery counters.
#[derive(Debug, Default)]
pub struct DispatchStats {
    queued: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchStatsSnapshot {
    pub queued: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub failed: u64,
    /// Ended because the circuit was open.
    pub rejected: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Handle for enqueueing notifications.
///
/// Cheaply cloneable. Enqueueing never waits: when the queue is full the
/// notification is dropped and counted.
#[derive(Clone)]
pub struct NotifyDispatcher {
    tx: mpsc::Sender<Notification>,
    stats: Arc<DispatchStats>,
}

impl NotifyDispatcher {
    /// Returns `true` if the notification was queued.
    pub fn try_dispatch(&self, notification: Notification) -> bool {
        match self.tx.try_send(notification) {
            Ok(()) => {
                self.stats.queued.fetch_add(1, Ordering::Relaxed);
                metrics::NOTIFICATIONS.with_label_values(&["queued"]).inc();
                true
            }
            Err(e) => {
                warn!("Dropping notification: {}", e);
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::NOTIFICATIONS.with_label_values(&["dropped"]).inc();
                false
            }
        }
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    /// Counters that outlive this handle (and its channel sender).
    pub fn shared_stats(&self) -> Arc<DispatchStats> {
        Arc::clone(&self.stats)
    }
}

enum Outcome {
    Delivered,
    Failed,
    Rejected,
}

#[derive(Clone)]
struct Delivery {
    notifier: Arc<dyn Notifier>,
    breaker: Arc<CircuitBreaker>,
    stats: Arc<DispatchStats>,
    max_attempts: u32,
    backoff: Duration,
    timeout: Duration,
}

impl Delivery {
    async fn deliver(&self, notification: Notification) {
        let outcome = self.attempt_all(&notification).await;
        let label = match outcome {
            Outcome::Delivered => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                "delivered"
            }
            Outcome::Failed => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                "failed"
            }
            Outcome::Rejected => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                "circuit_open"
            }
        };
        metrics::NOTIFICATIONS.with_label_values(&[label]).inc();
    }

    async fn attempt_all(&self, notification: &Notification) -> Outcome {
        let mut delay = self.backoff;

        for attempt in 1..=self.max_attempts {
            let result = self
                .breaker
                .call(|| async {
                    tokio::time::timeout(self.timeout, self.notifier.send(notification))
                        .await
                        .unwrap_or(Err(NotifyError::Timeout))
                })
                .await;

            match result {
                Ok(()) => {
                    debug!(ticket_id = %notification.ticket_id, attempt, "Notification delivered");
                    return Outcome::Delivered;
                }
                Err(CircuitError::Open { retry_after }) => {
                    warn!(
                        ticket_id = %notification.ticket_id,
                        ?retry_after,
                        "Circuit open, giving up on notification"
                    );
                    return Outcome::Rejected;
                }
                Err(CircuitError::Inner(e)) => {
                    if attempt == self.max_attempts {
                        warn!(
                            ticket_id = %notification.ticket_id,
                            attempts = attempt,
                            error = %e,
                            "Notification failed"
                        );
                        return Outcome::Failed;
                    }
                    debug!(ticket_id = %notification.ticket_id, attempt, error = %e, "Retrying notification");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
            }
        }

        Outcome::Failed
    }
}

/// Background task draining the notification queue.
pub struct NotifyWorker {
    rx: mpsc::Receiver<Notification>,
    delivery: Delivery,
    in_flight: Arc<Semaphore>,
    max_in_flight: u32,
}

impl NotifyWorker {
    /// Deliver queued notifications until every dispatcher is dropped, then
    /// wait for in-flight deliveries to finish.
    ///
    /// This should be spawned as a background task.
    pub async fn run(mut self) {
        info!("Notify worker started");

        while let Some(notification) = self.rx.recv().await {
            let permit = match Arc::clone(&self.in_flight).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let delivery = self.delivery.clone();
            tokio::spawn(async move {
                delivery.deliver(notification).await;
                drop(permit);
            });
        }

        // every permit back means no delivery is still running
        let _ = self.in_flight.acquire_many(self.max_in_flight).await;
        info!("Notify worker shutting down");
    }
}

/// Create a dispatcher handle and the worker that serves it.
///
/// Spawn the worker with `tokio::spawn(worker.run())`.
pub fn create_notify_system(
    notifier: Arc<dyn Notifier>,
    breaker: Arc<CircuitBreaker>,
    config: &NotifyConfig,
) -> (NotifyDispatcher, NotifyWorker) {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let stats = Arc::new(DispatchStats::default());
    let max_in_flight = u32::try_from(config.max_in_flight.max(1)).unwrap_or(u32::MAX);

    let dispatcher = NotifyDispatcher {
        tx,
        stats: Arc::clone(&stats),
    };
    let worker = NotifyWorker {
        rx,
        delivery: Delivery {
            notifier,
            breaker,
            stats,
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
            timeout: Duration::from_secs(config.timeout_secs),
        },
        in_flight: Arc::new(Semaphore::new(max_in_flight as usize)),
        max_in_flight,
    };
    (dispatcher, worker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::testing::MockNotifier;
    use crate::ticket::Urgency;

    fn notification(id: &str) -> Notification {
        Notification {
            ticket_id: id.to_string(),
            tenant_id: "acme".to_string(),
            urgency: Urgency::High,
            reason: "test".to_string(),
        }
    }

    fn config() -> NotifyConfig {
        NotifyConfig {
            backoff_ms: 10,
            ..Default::default()
        }
    }

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new("notify", CircuitBreakerConfig::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_queued_notifications() {
        let notifier = Arc::new(MockNotifier::new());
        let (dispatcher, worker) = create_notify_system(notifier.clone(), breaker(), &config());
        let worker = tokio::spawn(worker.run());

        assert!(dispatcher.try_dispatch(notification("ext-001")));
        assert!(dispatcher.try_dispatch(notification("ext-002")));
        let stats = dispatcher.shared_stats();
        drop(dispatcher);
        worker.await.unwrap();

        assert_eq!(notifier.delivered().len(), 2);
        let stats = stats.snapshot();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.delivered, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let notifier = Arc::new(MockNotifier::new());
        notifier.fail_first_attempts(2);
        let breaker = breaker();
        let (dispatcher, worker) =
            create_notify_system(notifier.clone(), breaker.clone(), &config());
        let worker = tokio::spawn(worker.run());

        dispatcher.try_dispatch(notification("ext-001"));
        let stats = dispatcher.shared_stats();
        drop(dispatcher);
        worker.await.unwrap();

        assert_eq!(notifier.attempts_for("ext-001"), 3);
        assert_eq!(stats.snapshot().delivered, 1);
        assert_eq!(breaker.status().failure_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let notifier = Arc::new(MockNotifier::new());
        notifier.fail_first_attempts(10);
        let (dispatcher, worker) = create_notify_system(notifier.clone(), breaker(), &config());
        let worker = tokio::spawn(worker.run());

        dispatcher.try_dispatch(notification("ext-001"));
        let stats = dispatcher.shared_stats();
        drop(dispatcher);
        worker.await.unwrap();

        assert_eq!(notifier.attempts_for("ext-001"), 3);
        assert_eq!(stats.snapshot().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_stops_delivery_without_calling() {
        let notifier = Arc::new(MockNotifier::new());
        let breaker = breaker();
        for _ in 0..5 {
            let _ = breaker.call(|| async { Err::<(), _>("down") }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let (dispatcher, worker) =
            create_notify_system(notifier.clone(), breaker.clone(), &config());
        let worker = tokio::spawn(worker.run());
        dispatcher.try_dispatch(notification("ext-001"));
        let stats = dispatcher.shared_stats();
        drop(dispatcher);
        worker.await.unwrap();

        assert_eq!(notifier.attempts_for("ext-001"), 0);
        assert_eq!(stats.snapshot().rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_endpoint_counts_as_failure() {
        let notifier = Arc::new(MockNotifier::new());
        notifier.set_delay(Duration::from_secs(60));
        let cfg = NotifyConfig {
            max_attempts: 1,
            ..config()
        };
        let breaker = breaker();
        let (dispatcher, worker) = create_notify_system(notifier.clone(), breaker.clone(), &cfg);
        let worker = tokio::spawn(worker.run());

        dispatcher.try_dispatch(notification("ext-001"));
        let stats = dispatcher.shared_stats();
        drop(dispatcher);
        worker.await.unwrap();

        assert_eq!(stats.snapshot().failed, 1);
        assert_eq!(breaker.status().failure_count, 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let notifier = Arc::new(MockNotifier::new());
        let cfg = NotifyConfig {
            queue_capacity: 2,
            ..config()
        };
        // worker deliberately not spawned, so nothing drains the queue
        let (dispatcher, _worker) = create_notify_system(notifier, breaker(), &cfg);

        assert!(dispatcher.try_dispatch(notification("ext-001")));
        assert!(dispatcher.try_dispatch(notification("ext-002")));
        assert!(!dispatcher.try_dispatch(notification("ext-003")));

        let stats = dispatcher.stats();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.dropped, 1);
    }
}
