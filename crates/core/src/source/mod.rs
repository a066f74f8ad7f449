//! External ticket source and the retrying page fetcher.

mod fetcher;
mod http;

pub use fetcher::{FetchError, FetchPolicy, PageFetcher};
pub use http::HttpTicketSource;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ticket::ExternalTicket;

/// Where tickets are pulled from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Base URL of the provider, e.g. `http://mock-external-api:9000`.
    pub base_url: String,

    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Per-request timeout.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Ask the provider to include deleted records (flagged `deleted`).
    #[serde(default)]
    pub include_deleted: bool,
}

fn default_page_size() -> u32 {
    50
}

fn default_timeout() -> u64 {
    10
}

#[derive(Debug, Error)]
pub enum SourceError {
    /// Upstream asked us to back off (HTTP 429).
    #[error("rate limited by source, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Network failure, timeout or 5xx. Worth retrying.
    #[error("transient source error: {0}")]
    Transient(String),

    /// Anything retrying will not fix.
    #[error("source error: {0}")]
    Permanent(String),
}

/// One page of records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TicketPage {
    pub items: Vec<ExternalTicket>,
    /// `None` when this is the last page.
    pub next_page: Option<u32>,
    pub total_count: Option<u64>,
}

impl TicketPage {
    /// Estimated page count for progress reporting.
    pub fn total_pages_estimate(&self, page_size: u32) -> Option<u32> {
        let page_size = u64::from(page_size.max(1));
        self.total_count
            .map(|total| u32::try_from(total.div_ceil(page_size)).unwrap_or(u32::MAX))
    }
}

/// Paginated read access to a ticket provider. Pages start at 1.
#[async_trait]
pub trait TicketSource: Send + Sync {
    async fn fetch_page(
        &self,
        tenant_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<TicketPage, SourceError>;
}
