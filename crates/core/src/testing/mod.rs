//! Testing utilities and mock implementations.
//!
//! Mocks for the two network collaborators of an ingestion run, so the whole
//! control plane can be exercised without a ticket provider or a
//! notification endpoint.
//!
//! # Example
//!
//! ```rust,ignore
//! use ticketsync_core::testing::{fixtures, MockNotifier, MockTicketSource};
//!
//! let source = MockTicketSource::new();
//! source.set_tickets("acme", fixtures::external_tickets(6));
//! source.rate_limit_once(2, Duration::from_secs(5));
//!
//! let notifier = MockNotifier::new();
//! notifier.fail_first_attempts(2);
//! ```

mod mock_notifier;
mod mock_source;

pub use mock_notifier::MockNotifier;
pub use mock_source::{MockTicketSource, RecordedFetch};

/// Test fixtures and helper functions.
pub mod fixtures {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use crate::ticket::ExternalTicket;

    pub fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// A live record with `updated_at == created_at`.
    pub fn external_ticket(id: &str, text: &str) -> ExternalTicket {
        ExternalTicket {
            id: id.to_string(),
            tenant_id: None,
            subject: Some(format!("Issue {id}")),
            text: text.to_string(),
            status: "open".to_string(),
            customer_id: Some("cust_100".to_string()),
            source: Some("email".to_string()),
            created_at: base_time(),
            updated_at: Some(base_time()),
            deleted: false,
        }
    }

    /// `count` plain records `ext-001`, `ext-002`, ...
    pub fn external_tickets(count: usize) -> Vec<ExternalTicket> {
        (1..=count)
            .map(|i| external_ticket(&format!("ext-{i:03}"), "How do I export my data?"))
            .collect()
    }

    /// The same record, modified `hours` after it was created.
    pub fn modified(ticket: &ExternalTicket, hours: i64, status: &str) -> ExternalTicket {
        let mut next = ticket.clone();
        next.status = status.to_string();
        next.updated_at = Some(ticket.created_at + Duration::hours(hours));
        next
    }
}
