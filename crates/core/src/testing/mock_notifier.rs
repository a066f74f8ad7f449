//! Mock notifier for testing.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::notify::{Notification, Notifier, NotifyError};

#[derive(Default)]
struct State {
    /// Failing attempts per ticket before one succeeds.
    fail_first: usize,
    attempts: HashMap<String, usize>,
    delivered: Vec<Notification>,
    delay: Option<Duration>,
}

/// Mock implementation of [`Notifier`].
///
/// By default every attempt succeeds. [`MockNotifier::fail_first_attempts`]
/// makes the first `n` attempts for each ticket fail, like a flaky endpoint.
#[derive(Default)]
pub struct MockNotifier {
    state: Mutex<State>,
}

impl std::fmt::Debug for MockNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockNotifier").finish_non_exhaustive()
    }
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fail_first_attempts(&self, n: usize) {
        self.state().fail_first = n;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = Some(delay);
    }

    /// Successfully delivered notifications, in delivery order.
    pub fn delivered(&self) -> Vec<Notification> {
        self.state().delivered.clone()
    }

    pub fn attempts_for(&self, ticket_id: &str) -> usize {
        self.state().attempts.get(ticket_id).copied().unwrap_or(0)
    }

    pub fn total_attempts(&self) -> usize {
        self.state().attempts.values().sum()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let (attempt, fail_first, delay) = {
            let mut state = self.state();
            let attempt = state
                .attempts
                .entry(notification.ticket_id.clone())
                .or_insert(0);
            *attempt += 1;
            let attempt = *attempt;
            (attempt, state.fail_first, state.delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if attempt <= fail_first {
            return Err(NotifyError::Delivery(format!(
                "injected failure {attempt}/{fail_first}"
            )));
        }

        self.state().delivered.push(notification.clone());
        Ok(())
    }
}
