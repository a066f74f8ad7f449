//! HTTP ticket source.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{SourceConfig, SourceError, TicketPage, TicketSource};
use crate::ticket::ExternalTicket;

/// Used when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Wire format of `GET /external/support-tickets`.
#[derive(Debug, Deserialize)]
struct PageResponse {
    #[serde(alias = "tickets", default)]
    items: Vec<ExternalTicket>,
    #[serde(default)]
    next_page: Option<u32>,
    #[serde(default)]
    has_more: Option<bool>,
    #[serde(default)]
    total_count: Option<u64>,
}

impl PageResponse {
    fn into_page(self, page: u32) -> TicketPage {
        let next_page = self
            .next_page
            .or_else(|| self.has_more.filter(|more| *more).map(|_| page + 1));
        TicketPage {
            items: self.items,
            next_page,
            total_count: self.total_count,
        }
    }
}

/// Reads tickets from `{base_url}/external/support-tickets`.
pub struct HttpTicketSource {
    client: Client,
    base_url: String,
    include_deleted: bool,
}

impl HttpTicketSource {
    pub fn new(config: &SourceConfig) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SourceError::Permanent(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            include_deleted: config.include_deleted,
        })
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values fall back to the default.
///
/// Values too large for a `Duration` saturate; callers clamp to their own ceiling.
fn parse_retry_after(value: Option<&str>) -> Duration {
    value
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

#[async_trait]
impl TicketSource for HttpTicketSource {
    async fn fetch_page(
        &self,
        tenant_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<TicketPage, SourceError> {
        let url = format!("{}/external/support-tickets", self.base_url);
        debug!(tenant_id, page, page_size, "Fetching ticket page");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("tenant_id", tenant_id.to_string()),
                ("page", page.to_string()),
                ("page_size", page_size.to_string()),
                ("include_deleted", self.include_deleted.to_string()),
            ])
            .send()
            .await
            .map_err(|e| SourceError::Transient(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(
                response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok()),
            );
            warn!(tenant_id, page, ?retry_after, "Ticket source rate limited");
            return Err(SourceError::RateLimited { retry_after });
        }
        if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
            return Err(SourceError::Transient(format!("source returned {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Permanent(format!("source returned {status}: {body}")));
        }

        let body: PageResponse = response
            .json()
            .await
            .map_err(|e| SourceError::Permanent(format!("failed to parse page: {e}")))?;
        Ok(body.into_page(page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after(Some("5")), Duration::from_secs(5));
        assert_eq!(parse_retry_after(Some(" 2 ")), Duration::from_secs(2));
        assert_eq!(
            parse_retry_after(Some("Wed, 21 Oct 2026 07:28:00 GMT")),
            DEFAULT_RETRY_AFTER
        );
        assert_eq!(parse_retry_after(None), DEFAULT_RETRY_AFTER);
        assert_eq!(parse_retry_after(Some("-3")), DEFAULT_RETRY_AFTER);
    }

    #[test]
    fn test_parse_retry_after_huge_values_saturate() {
        assert_eq!(parse_retry_after(Some("1e30")), Duration::MAX);
        assert_eq!(
            parse_retry_after(Some("31536000")),
            Duration::from_secs(31_536_000)
        );
        assert_eq!(parse_retry_after(Some("inf")), DEFAULT_RETRY_AFTER);
        assert_eq!(parse_retry_after(Some("NaN")), DEFAULT_RETRY_AFTER);
    }

    #[test]
    fn test_page_response_accepts_tickets_key() {
        let body: PageResponse = serde_json::from_str(
            r#"{"tickets":[{"id":"ext-001","status":"open","message":"hi","created_at":"2026-01-01T00:00:00Z"}],"next_page":2,"total_count":120}"#,
        )
        .unwrap();
        let page = body.into_page(1);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.next_page, Some(2));
        assert_eq!(page.total_count, Some(120));
    }

    #[test]
    fn test_page_response_with_has_more() {
        let body: PageResponse =
            serde_json::from_str(r#"{"items":[],"has_more":true}"#).unwrap();
        assert_eq!(body.into_page(3).next_page, Some(4));

        let body: PageResponse =
            serde_json::from_str(r#"{"items":[],"has_more":false}"#).unwrap();
        assert_eq!(body.into_page(3).next_page, None);
    }

    #[test]
    fn test_new_trims_trailing_slash() {
        let source = HttpTicketSource::new(&SourceConfig {
            base_url: "http://localhost:9000/".to_string(),
            page_size: 50,
            timeout_secs: 10,
            include_deleted: false,
        })
        .unwrap();
        assert_eq!(source.base_url, "http://localhost:9000");
    }
}
