use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Medium => "medium",
            Urgency::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Urgency::Low),
            "medium" => Some(Urgency::Medium),
            "high" => Some(Urgency::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Negative,
    Neutral,
    Positive,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Negative => "negative",
            Sentiment::Neutral => "neutral",
            Sentiment::Positive => "positive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "negative" => Some(Sentiment::Negative),
            "neutral" => Some(Sentiment::Neutral),
            "positive" => Some(Sentiment::Positive),
            _ => None,
        }
    }
}

/// Result of classifying a ticket's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub urgency: Urgency,
    pub sentiment: Sentiment,
    pub requires_action: bool,
}

/// A record as returned by the external ticket source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalTicket {
    pub id: String,
    /// Set by feeds that serve several tenants at once.
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default, alias = "message")]
    pub text: String,
    pub status: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Sources that never modify tickets omit this; creation time stands in.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted: bool,
}

impl ExternalTicket {
    pub fn effective_updated_at(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }

    /// Whether the record may be stored under `tenant_id`.
    pub fn belongs_to(&self, tenant_id: &str) -> bool {
        self.tenant_id.as_deref().map_or(true, |owner| owner == tenant_id)
    }
}

/// A stored ticket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ticket {
    pub tenant_id: String,
    pub external_id: String,
    pub subject: Option<String>,
    pub message: String,
    pub customer_id: Option<String>,
    pub source: Option<String>,
    pub status: String,
    pub urgency: Urgency,
    pub sentiment: Sentiment,
    pub requires_action: bool,
    pub created_at: DateTime<Utc>,
    /// As reported by the source; drives change detection.
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Ticket {
    /// Build the stored form of an external record.
    pub fn from_external(
        tenant_id: &str,
        external: &ExternalTicket,
        classification: Classification,
    ) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            external_id: external.id.clone(),
            subject: external.subject.clone(),
            message: external.text.clone(),
            customer_id: external.customer_id.clone(),
            source: external.source.clone(),
            status: external.status.clone(),
            urgency: classification.urgency,
            sentiment: classification.sentiment,
            requires_action: classification.requires_action,
            created_at: external.created_at,
            updated_at: external.effective_updated_at(),
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Field-level differences between `self` (stored) and `next`.
    ///
    /// `updated_at` is not a tracked field; it changes on every upsert.
    pub fn diff(&self, next: &Ticket) -> Vec<FieldChange> {
        let mut changes = Vec::new();
        let mut track = |field: &'static str, old: Option<String>, new: Option<String>| {
            if old != new {
                changes.push(FieldChange {
                    field,
                    old_value: old,
                    new_value: new,
                });
            }
        };

        track("subject", self.subject.clone(), next.subject.clone());
        track("message", Some(self.message.clone()), Some(next.message.clone()));
        track("customer_id", self.customer_id.clone(), next.customer_id.clone());
        track("source", self.source.clone(), next.source.clone());
        track("status", Some(self.status.clone()), Some(next.status.clone()));
        track(
            "urgency",
            Some(self.urgency.as_str().to_string()),
            Some(next.urgency.as_str().to_string()),
        );
        track(
            "sentiment",
            Some(self.sentiment.as_str().to_string()),
            Some(next.sentiment.as_str().to_string()),
        );
        track(
            "requires_action",
            Some(self.requires_action.to_string()),
            Some(next.requires_action.to_string()),
        );
        track(
            "deleted_at",
            self.deleted_at.map(|dt| dt.to_rfc3339()),
            next.deleted_at.map(|dt| dt.to_rfc3339()),
        );

        changes
    }
}

/// One changed field, before it is stamped into a history entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    pub field: &'static str,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// Immutable record of a single field change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TicketHistoryEntry {
    pub id: i64,
    pub tenant_id: String,
    pub external_id: String,
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub observed_at: DateTime<Utc>,
}
