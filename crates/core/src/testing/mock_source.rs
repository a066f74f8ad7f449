//! Mock ticket source for testing.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::source::{SourceError, TicketPage, TicketSource};
use crate::ticket::ExternalTicket;

/// A recorded fetch for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedFetch {
    pub tenant_id: String,
    pub page: u32,
    pub page_size: u32,
    /// Tokio clock, so it is meaningful under paused time.
    pub at: Instant,
}

#[derive(Debug, Clone)]
enum Injected {
    Transient,
    RateLimited(Duration),
    Permanent,
}

#[derive(Default)]
struct State {
    tickets: HashMap<String, Vec<ExternalTicket>>,
    /// Failures to return, per page, before serving it normally.
    failures: HashMap<u32, Vec<Injected>>,
    delay: Option<Duration>,
    open_ended: bool,
    fetches: Vec<RecordedFetch>,
}

/// Mock implementation of [`TicketSource`].
///
/// Serves each tenant's tickets in `page_size` slices and reports
/// `next_page` until the last slice, like the real provider. Failures can be
/// injected per page number.
#[derive(Default)]
pub struct MockTicketSource {
    state: Mutex<State>,
}

impl std::fmt::Debug for MockTicketSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTicketSource").finish_non_exhaustive()
    }
}

impl MockTicketSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the full dataset of a tenant.
    pub fn set_tickets(&self, tenant_id: &str, tickets: Vec<ExternalTicket>) {
        self.state().tickets.insert(tenant_id.to_string(), tickets);
    }

    /// Replace one record of a tenant by id, appending it if unknown.
    pub fn upsert_ticket(&self, tenant_id: &str, ticket: ExternalTicket) {
        let mut state = self.state();
        let tickets = state.tickets.entry(tenant_id.to_string()).or_default();
        match tickets.iter_mut().find(|t| t.id == ticket.id) {
            Some(existing) => *existing = ticket,
            None => tickets.push(ticket),
        }
    }

    /// Remove a record from a tenant's dataset (a hard delete upstream).
    pub fn remove_ticket(&self, tenant_id: &str, id: &str) {
        if let Some(tickets) = self.state().tickets.get_mut(tenant_id) {
            tickets.retain(|t| t.id != id);
        }
    }

    /// The next `times` requests for `page` fail with a transient error.
    pub fn fail_transient(&self, page: u32, times: usize) {
        let mut state = self.state();
        let queue = state.failures.entry(page).or_default();
        queue.extend(std::iter::repeat(Injected::Transient).take(times));
    }

    /// The next request for `page` is answered with 429 and `retry_after`.
    pub fn rate_limit_once(&self, page: u32, retry_after: Duration) {
        self.state()
            .failures
            .entry(page)
            .or_default()
            .push(Injected::RateLimited(retry_after));
    }

    /// The next request for `page` fails permanently.
    pub fn fail_permanent(&self, page: u32) {
        self.state()
            .failures
            .entry(page)
            .or_default()
            .push(Injected::Permanent);
    }

    /// Delay every response.
    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = Some(delay);
    }

    /// Always advertise a next page, so pagination only ends on an empty page.
    pub fn set_open_ended(&self, open_ended: bool) {
        self.state().open_ended = open_ended;
    }

    pub fn fetches(&self) -> Vec<RecordedFetch> {
        self.state().fetches.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state().fetches.len()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.state().fetches.iter().map(|f| f.at).collect()
    }
}

#[async_trait]
impl TicketSource for MockTicketSource {
    async fn fetch_page(
        &self,
        tenant_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<TicketPage, SourceError> {
        let delay = {
            let mut state = self.state();
            state.fetches.push(RecordedFetch {
                tenant_id: tenant_id.to_string(),
                page,
                page_size,
                at: Instant::now(),
            });
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(queue) = state.failures.get_mut(&page) {
            if !queue.is_empty() {
                return Err(match queue.remove(0) {
                    Injected::Transient => SourceError::Transient("injected failure".into()),
                    Injected::RateLimited(retry_after) => SourceError::RateLimited { retry_after },
                    Injected::Permanent => SourceError::Permanent("injected failure".into()),
                });
            }
        }

        let all = state.tickets.get(tenant_id).cloned().unwrap_or_default();
        let size = page_size.max(1) as usize;
        let start = (page.max(1) as usize - 1) * size;
        let end = (start + size).min(all.len());
        let items = if start < all.len() {
            all[start..end].to_vec()
        } else {
            Vec::new()
        };
        let next_page = if state.open_ended || end < all.len() {
            Some(page + 1)
        } else {
            None
        };

        Ok(TicketPage {
            items,
            next_page,
            total_count: Some(all.len() as u64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    #[tokio::test]
    async fn test_pages_through_dataset() {
        let source = MockTicketSource::new();
        source.set_tickets("acme", fixtures::external_tickets(5));

        let first = source.fetch_page("acme", 1, 2).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.next_page, Some(2));
        assert_eq!(first.total_count, Some(5));

        let last = source.fetch_page("acme", 3, 2).await.unwrap();
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.next_page, None);

        let other = source.fetch_page("globex", 1, 2).await.unwrap();
        assert!(other.items.is_empty());
        assert_eq!(source.call_count(), 3);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let source = MockTicketSource::new();
        source.set_tickets("acme", fixtures::external_tickets(2));
        source.rate_limit_once(1, Duration::from_secs(5));
        source.fail_transient(1, 1);

        assert!(matches!(
            source.fetch_page("acme", 1, 2).await,
            Err(SourceError::RateLimited { .. })
        ));
        assert!(matches!(
            source.fetch_page("acme", 1, 2).await,
            Err(SourceError::Transient(_))
        ));
        assert!(source.fetch_page("acme", 1, 2).await.is_ok());
    }
}
