//! Change detection between fetched records and stored tickets.
//!
//! Re-applying an unchanged page writes nothing: a stored ticket is only
//! touched when the source reports a strictly newer `updated_at`.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::classify::Classifier;
use crate::metrics;
use crate::ticket::{ExternalTicket, Ticket, TicketError, TicketStore, Urgency};

/// What applying one page did.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub soft_deleted: u64,
    /// Records that name a different tenant.
    pub skipped: u64,
    /// High-urgency tickets that were inserted or updated.
    pub notify: Vec<Ticket>,
    /// External ids of this tenant seen on the page (deleted ones included).
    pub seen_ids: Vec<String>,
}

impl SyncOutcome {
    pub fn upserted(&self) -> u64 {
        self.inserted + self.updated
    }
}

enum Action {
    Inserted,
    Updated,
    Unchanged,
    SoftDeleted,
}

pub struct ChangeSync {
    store: Arc<dyn TicketStore>,
    classifier: Arc<dyn Classifier>,
}

impl ChangeSync {
    pub fn new(store: Arc<dyn TicketStore>, classifier: Arc<dyn Classifier>) -> Self {
        Self { store, classifier }
    }

    /// Reconcile one fetched page against the store.
    ///
    /// Each ticket is written in its own transaction, so everything applied
    /// before an error stays applied.
    pub fn apply_page(
        &self,
        tenant_id: &str,
        records: &[ExternalTicket],
    ) -> Result<SyncOutcome, TicketError> {
        let mut outcome = SyncOutcome::default();

        for record in records {
            if !record.belongs_to(tenant_id) {
                outcome.skipped += 1;
                continue;
            }
            outcome.seen_ids.push(record.id.clone());

            let (action, ticket) = self.apply_one(tenant_id, record)?;
            let label = match action {
                Action::Inserted => {
                    outcome.inserted += 1;
                    "inserted"
                }
                Action::Updated => {
                    outcome.updated += 1;
                    "updated"
                }
                Action::Unchanged => {
                    outcome.unchanged += 1;
                    "unchanged"
                }
                Action::SoftDeleted => {
                    outcome.soft_deleted += 1;
                    "soft_deleted"
                }
            };
            metrics::TICKETS_SYNCED.with_label_values(&[label]).inc();

            if let Some(ticket) = ticket {
                if ticket.urgency == Urgency::High {
                    outcome.notify.push(ticket);
                }
            }
        }

        debug!(
            tenant_id,
            inserted = outcome.inserted,
            updated = outcome.updated,
            unchanged = outcome.unchanged,
            soft_deleted = outcome.soft_deleted,
            "Applied page"
        );
        Ok(outcome)
    }

    /// Returns the written ticket for inserts and updates.
    fn apply_one(
        &self,
        tenant_id: &str,
        record: &ExternalTicket,
    ) -> Result<(Action, Option<Ticket>), TicketError> {
        let existing = self.store.get(tenant_id, &record.id)?;

        if record.deleted {
            let deleted = match existing {
                Some(ref stored) if !stored.is_deleted() => {
                    self.store.soft_delete(tenant_id, &record.id, Utc::now())?
                }
                _ => false,
            };
            let action = if deleted {
                Action::SoftDeleted
            } else {
                Action::Unchanged
            };
            return Ok((action, None));
        }

        let classification = self
            .classifier
            .classify(record.subject.as_deref(), &record.text);
        let candidate = Ticket::from_external(tenant_id, record, classification);

        match existing {
            None => {
                self.store.upsert_with_history(&candidate, &[])?;
                Ok((Action::Inserted, Some(candidate)))
            }
            // Equal timestamps are a no-op even if the content differs.
            Some(stored) if candidate.updated_at > stored.updated_at => {
                // a reappearing soft-deleted ticket is revived here, and the
                // diff records `deleted_at` going back to null
                let changes = stored.diff(&candidate);
                self.store.upsert_with_history(&candidate, &changes)?;
                Ok((Action::Updated, Some(candidate)))
            }
            Some(_) => Ok((Action::Unchanged, None)),
        }
    }

    /// Stored live tickets of the tenant that are missing from `seen_ids`.
    pub fn detect_deleted(
        &self,
        tenant_id: &str,
        seen_ids: &HashSet<String>,
    ) -> Result<Vec<String>, TicketError> {
        Ok(self
            .store
            .active_external_ids(tenant_id)?
            .into_iter()
            .filter(|id| !seen_ids.contains(id))
            .collect())
    }

    /// Soft-delete the given tickets. Returns how many were actually deleted.
    pub fn mark_deleted(&self, tenant_id: &str, external_ids: &[String]) -> Result<u64, TicketError> {
        let now = Utc::now();
        let mut deleted = 0;
        for external_id in external_ids {
            if self.store.soft_delete(tenant_id, external_id, now)? {
                deleted += 1;
            }
        }
        if deleted > 0 {
            metrics::TICKETS_SYNCED
                .with_label_values(&["soft_deleted"])
                .inc_by(deleted);
        }
        Ok(deleted)
    }
}
