//! Best-effort notifications for high-urgency tickets.
//!
//! Ingestion only ever enqueues ([`NotifyDispatcher::try_dispatch`] never
//! waits). A background [`NotifyWorker`] delivers through the circuit breaker.

mod dispatcher;
mod http;

pub use dispatcher::{
    create_notify_system, DispatchStats, DispatchStatsSnapshot, NotifyDispatcher, NotifyWorker,
};
pub use http::{HttpNotifier, LogNotifier};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ticket::{Ticket, Urgency};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Endpoint receiving one POST per notification. Unset means log only.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Attempts per notification, the first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry; doubles on each further retry.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Notifications waiting for delivery. When full, new ones are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Deliveries running at the same time.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_timeout() -> u64 {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    200
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_max_in_flight() -> usize {
    8
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_timeout(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            queue_capacity: default_queue_capacity(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),

    #[error("notification timed out")]
    Timeout,
}

/// Body of a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub ticket_id: String,
    pub tenant_id: String,
    pub urgency: Urgency,
    pub reason: String,
}

impl Notification {
    pub fn for_ticket(ticket: &Ticket) -> Self {
        Self {
            ticket_id: ticket.external_id.clone(),
            tenant_id: ticket.tenant_id.clone(),
            urgency: ticket.urgency,
            reason: format!("{} urgency ticket requires action", ticket.urgency.as_str()),
        }
    }
}

/// Delivers a single notification.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}
