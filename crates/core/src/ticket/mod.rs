//! Ticket model and storage.
//!
//! Tickets are keyed by `(tenant_id, external_id)` and are never removed:
//! deletions set `deleted_at`. Every tracked field change is appended to the
//! ticket history.

mod sqlite_store;
mod store;
mod types;

pub use sqlite_store::SqliteTicketStore;
pub use store::{TicketError, TicketFilter, TicketStore};
pub use types::*;
