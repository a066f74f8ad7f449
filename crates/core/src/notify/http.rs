use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::info;

use super::{Notification, Notifier, NotifyError};

/// POSTs each notification as JSON to a fixed URL.
pub struct HttpNotifier {
    client: Client,
    url: String,
}

impl HttpNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Delivery(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NotifyError::Timeout
                } else {
                    NotifyError::Delivery(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(NotifyError::Delivery(format!("endpoint returned {status}")))
        }
    }
}

/// Stand-in used when no endpoint is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            tenant_id = %notification.tenant_id,
            ticket_id = %notification.ticket_id,
            reason = %notification.reason,
            "Notification (no endpoint configured)"
        );
        Ok(())
    }
}
