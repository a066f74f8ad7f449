//! SQLite-backed ticket store implementation.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use super::{
    FieldChange, Sentiment, Ticket, TicketError, TicketFilter, TicketHistoryEntry, TicketStore,
    Urgency,
};
use crate::db::{dt_to_text, open_connection, open_in_memory, parse_rfc3339};

const TICKET_COLUMNS: &str = "tenant_id, external_id, subject, message, customer_id, source, status, urgency, sentiment, requires_action, created_at, updated_at, deleted_at";

/// SQLite-backed ticket store.
pub struct SqliteTicketStore {
    conn: Mutex<Connection>,
}

impl SqliteTicketStore {
    /// Create a new SQLite ticket store, creating the database file and tables if needed.
    pub fn new(path: &Path) -> Result<Self, TicketError> {
        let conn = open_connection(path).map_err(|e| TicketError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory SQLite ticket store (useful for testing).
    pub fn in_memory() -> Result<Self, TicketError> {
        let conn = open_in_memory().map_err(|e| TicketError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), TicketError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tickets (
                tenant_id TEXT NOT NULL,
                external_id TEXT NOT NULL,
                subject TEXT,
                message TEXT NOT NULL,
                customer_id TEXT,
                source TEXT,
                status TEXT NOT NULL,
                urgency TEXT NOT NULL,
                sentiment TEXT NOT NULL,
                requires_action INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT,
                UNIQUE (tenant_id, external_id)
            );

            CREATE INDEX IF NOT EXISTS idx_tickets_tenant_created ON tickets(tenant_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_tickets_tenant_status_created ON tickets(tenant_id, status, created_at);
            CREATE INDEX IF NOT EXISTS idx_tickets_tenant_urgency ON tickets(tenant_id, urgency);
            CREATE INDEX IF NOT EXISTS idx_tickets_tenant_deleted ON tickets(tenant_id, deleted_at);

            CREATE TABLE IF NOT EXISTS ticket_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                external_id TEXT NOT NULL,
                field TEXT NOT NULL,
                old_value TEXT,
                new_value TEXT,
                observed_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_ticket_history_ticket ON ticket_history(tenant_id, external_id, observed_at);
            "#,
        )
        .map_err(|e| TicketError::Database(e.to_string()))
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, TicketError> {
        self.conn
            .lock()
            .map_err(|_| TicketError::Database("ticket store mutex poisoned".to_string()))
    }

    fn build_where_clause(filter: &TicketFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref tenant_id) = filter.tenant_id {
            conditions.push("tenant_id = ?");
            params.push(Box::new(tenant_id.clone()));
        }

        if let Some(ref status) = filter.status {
            conditions.push("status = ?");
            params.push(Box::new(status.clone()));
        }

        if let Some(urgency) = filter.urgency {
            conditions.push("urgency = ?");
            params.push(Box::new(urgency.as_str()));
        }

        if !filter.include_deleted {
            conditions.push("deleted_at IS NULL");
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn row_to_ticket(row: &rusqlite::Row) -> rusqlite::Result<Ticket> {
        let urgency: String = row.get(7)?;
        let sentiment: String = row.get(8)?;
        let created_at: String = row.get(10)?;
        let updated_at: String = row.get(11)?;
        let deleted_at: Option<String> = row.get(12)?;

        Ok(Ticket {
            tenant_id: row.get(0)?,
            external_id: row.get(1)?,
            subject: row.get(2)?,
            message: row.get(3)?,
            customer_id: row.get(4)?,
            source: row.get(5)?,
            status: row.get(6)?,
            urgency: Urgency::parse(&urgency).unwrap_or(Urgency::Low),
            sentiment: Sentiment::parse(&sentiment).unwrap_or(Sentiment::Neutral),
            requires_action: row.get(9)?,
            created_at: parse_rfc3339(&created_at),
            updated_at: parse_rfc3339(&updated_at),
            deleted_at: deleted_at.as_deref().map(parse_rfc3339),
        })
    }

    fn row_to_history(row: &rusqlite::Row) -> rusqlite::Result<TicketHistoryEntry> {
        let observed_at: String = row.get(6)?;
        Ok(TicketHistoryEntry {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            external_id: row.get(2)?,
            field: row.get(3)?,
            old_value: row.get(4)?,
            new_value: row.get(5)?,
            observed_at: parse_rfc3339(&observed_at),
        })
    }

    fn insert_history(
        tx: &Transaction,
        tenant_id: &str,
        external_id: &str,
        changes: &[FieldChange],
        observed_at: DateTime<Utc>,
    ) -> Result<(), TicketError> {
        let mut stmt = tx
            .prepare_cached(
                "INSERT INTO ticket_history (tenant_id, external_id, field, old_value, new_value, observed_at) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .map_err(|e| TicketError::Database(e.to_string()))?;

        let observed_at = dt_to_text(observed_at);
        for change in changes {
            stmt.execute(params![
                tenant_id,
                external_id,
                change.field,
                change.old_value,
                change.new_value,
                observed_at,
            ])
            .map_err(|e| TicketError::Database(e.to_string()))?;
        }
        Ok(())
    }
}

impl TicketStore for SqliteTicketStore {
    fn get(&self, tenant_id: &str, external_id: &str) -> Result<Option<Ticket>, TicketError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE tenant_id = ? AND external_id = ?"),
            params![tenant_id, external_id],
            Self::row_to_ticket,
        )
        .optional()
        .map_err(|e| TicketError::Database(e.to_string()))
    }

    fn upsert_with_history(
        &self,
        ticket: &Ticket,
        changes: &[FieldChange],
    ) -> Result<(), TicketError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| TicketError::Database(e.to_string()))?;

        tx.execute(
            r#"
            INSERT INTO tickets (tenant_id, external_id, subject, message, customer_id, source, status, urgency, sentiment, requires_action, created_at, updated_at, deleted_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(tenant_id, external_id) DO UPDATE SET
                subject = excluded.subject,
                message = excluded.message,
                customer_id = excluded.customer_id,
                source = excluded.source,
                status = excluded.status,
                urgency = excluded.urgency,
                sentiment = excluded.sentiment,
                requires_action = excluded.requires_action,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                deleted_at = excluded.deleted_at
            "#,
            params![
                ticket.tenant_id,
                ticket.external_id,
                ticket.subject,
                ticket.message,
                ticket.customer_id,
                ticket.source,
                ticket.status,
                ticket.urgency.as_str(),
                ticket.sentiment.as_str(),
                ticket.requires_action,
                dt_to_text(ticket.created_at),
                dt_to_text(ticket.updated_at),
                ticket.deleted_at.map(dt_to_text),
            ],
        )
        .map_err(|e| TicketError::Database(e.to_string()))?;

        Self::insert_history(
            &tx,
            &ticket.tenant_id,
            &ticket.external_id,
            changes,
            Utc::now(),
        )?;

        tx.commit().map_err(|e| TicketError::Database(e.to_string()))
    }

    fn soft_delete(
        &self,
        tenant_id: &str,
        external_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, TicketError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| TicketError::Database(e.to_string()))?;

        let deleted_at = dt_to_text(at);
        let changed = tx
            .execute(
                "UPDATE tickets SET deleted_at = ? WHERE tenant_id = ? AND external_id = ? AND deleted_at IS NULL",
                params![deleted_at, tenant_id, external_id],
            )
            .map_err(|e| TicketError::Database(e.to_string()))?;

        if changed == 0 {
            return Ok(false);
        }

        let change = FieldChange {
            field: "deleted_at",
            old_value: None,
            new_value: Some(at.to_rfc3339()),
        };
        Self::insert_history(&tx, tenant_id, external_id, &[change], at)?;

        tx.commit()
            .map_err(|e| TicketError::Database(e.to_string()))?;
        Ok(true)
    }

    fn list(&self, filter: &TicketFilter) -> Result<Vec<Ticket>, TicketError> {
        let conn = self.conn()?;
        let (where_clause, mut params) = Self::build_where_clause(filter);

        let sql = format!(
            "SELECT {TICKET_COLUMNS} FROM tickets {where_clause} ORDER BY created_at DESC, external_id LIMIT ? OFFSET ?"
        );
        params.push(Box::new(filter.limit));
        params.push(Box::new(filter.offset));

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| TicketError::Database(e.to_string()))?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let tickets = stmt
            .query_map(param_refs.as_slice(), Self::row_to_ticket)
            .map_err(|e| TicketError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TicketError::Database(e.to_string()))?;

        Ok(tickets)
    }

    fn count(&self, filter: &TicketFilter) -> Result<i64, TicketError> {
        let conn = self.conn()?;
        let (where_clause, params) = Self::build_where_clause(filter);

        let sql = format!("SELECT COUNT(*) FROM tickets {where_clause}");
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))
            .map_err(|e| TicketError::Database(e.to_string()))
    }

    fn history(
        &self,
        tenant_id: &str,
        external_id: &str,
        limit: i64,
    ) -> Result<Vec<TicketHistoryEntry>, TicketError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, tenant_id, external_id, field, old_value, new_value, observed_at FROM ticket_history WHERE tenant_id = ? AND external_id = ? ORDER BY id DESC LIMIT ?",
            )
            .map_err(|e| TicketError::Database(e.to_string()))?;

        let entries = stmt
            .query_map(params![tenant_id, external_id, limit], Self::row_to_history)
            .map_err(|e| TicketError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TicketError::Database(e.to_string()))?;

        Ok(entries)
    }

    fn history_count(&self, tenant_id: &str) -> Result<i64, TicketError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT COUNT(*) FROM ticket_history WHERE tenant_id = ?",
            params![tenant_id],
            |row| row.get(0),
        )
        .map_err(|e| TicketError::Database(e.to_string()))
    }

    fn active_external_ids(&self, tenant_id: &str) -> Result<Vec<String>, TicketError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT external_id FROM tickets WHERE tenant_id = ? AND deleted_at IS NULL ORDER BY external_id",
            )
            .map_err(|e| TicketError::Database(e.to_string()))?;

        let ids = stmt
            .query_map(params![tenant_id], |row| row.get(0))
            .map_err(|e| TicketError::Database(e.to_string()))?
            .collect::<Result<Vec<String>, _>>()
            .map_err(|e| TicketError::Database(e.to_string()))?;

        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn ticket(tenant_id: &str, external_id: &str, status: &str) -> Ticket {
        let created_at = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        Ticket {
            tenant_id: tenant_id.to_string(),
            external_id: external_id.to_string(),
            subject: Some(format!("Issue {external_id}")),
            message: "hello".to_string(),
            customer_id: Some("cust_100".to_string()),
            source: Some("email".to_string()),
            status: status.to_string(),
            urgency: Urgency::Low,
            sentiment: Sentiment::Neutral,
            requires_action: false,
            created_at,
            updated_at: created_at,
            deleted_at: None,
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let store = SqliteTicketStore::in_memory().unwrap();
        let original = ticket("acme", "ext-001", "open");
        store.upsert_with_history(&original, &[]).unwrap();

        let fetched = store.get("acme", "ext-001").unwrap().unwrap();
        assert_eq!(fetched, original);
        assert!(store.get("globex", "ext-001").unwrap().is_none());
    }

    #[test]
    fn test_same_external_id_in_different_tenants_is_separate() {
        let store = SqliteTicketStore::in_memory().unwrap();
        store
            .upsert_with_history(&ticket("acme", "ext-001", "open"), &[])
            .unwrap();
        store
            .upsert_with_history(&ticket("globex", "ext-001", "closed"), &[])
            .unwrap();

        assert_eq!(store.count(&TicketFilter::new()).unwrap(), 2);
        assert_eq!(
            store.get("acme", "ext-001").unwrap().unwrap().status,
            "open"
        );
    }

    #[test]
    fn test_upsert_replaces_and_appends_history() {
        let store = SqliteTicketStore::in_memory().unwrap();
        let before = ticket("acme", "ext-001", "open");
        store.upsert_with_history(&before, &[]).unwrap();

        let mut after = before.clone();
        after.status = "closed".to_string();
        after.updated_at = before.updated_at + chrono::Duration::hours(1);
        let changes = before.diff(&after);
        store.upsert_with_history(&after, &changes).unwrap();

        assert_eq!(store.count(&TicketFilter::new()).unwrap(), 1);
        assert_eq!(store.get("acme", "ext-001").unwrap().unwrap(), after);

        let history = store.history("acme", "ext-001", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].field, "status");
        assert_eq!(history[0].old_value.as_deref(), Some("open"));
        assert_eq!(history[0].new_value.as_deref(), Some("closed"));
        assert_eq!(store.history_count("acme").unwrap(), 1);
    }

    #[test]
    fn test_soft_delete_hides_from_list_but_keeps_row() {
        let store = SqliteTicketStore::in_memory().unwrap();
        store
            .upsert_with_history(&ticket("acme", "ext-001", "open"), &[])
            .unwrap();
        store
            .upsert_with_history(&ticket("acme", "ext-002", "open"), &[])
            .unwrap();

        assert!(store.soft_delete("acme", "ext-001", Utc::now()).unwrap());
        // second delete is a no-op
        assert!(!store.soft_delete("acme", "ext-001", Utc::now()).unwrap());
        assert!(!store.soft_delete("acme", "missing", Utc::now()).unwrap());

        let filter = TicketFilter::new().with_tenant("acme");
        let visible = store.list(&filter).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].external_id, "ext-002");
        assert_eq!(store.count(&filter.clone().including_deleted()).unwrap(), 2);

        assert!(store.get("acme", "ext-001").unwrap().unwrap().is_deleted());
        let history = store.history("acme", "ext-001", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].field, "deleted_at");
        assert!(history[0].old_value.is_none());

        assert_eq!(store.active_external_ids("acme").unwrap(), vec!["ext-002"]);
    }

    #[test]
    fn test_list_filters() {
        let store = SqliteTicketStore::in_memory().unwrap();
        let mut urgent = ticket("acme", "ext-001", "open");
        urgent.urgency = Urgency::High;
        store.upsert_with_history(&urgent, &[]).unwrap();
        store
            .upsert_with_history(&ticket("acme", "ext-002", "closed"), &[])
            .unwrap();
        store
            .upsert_with_history(&ticket("globex", "ext-003", "open"), &[])
            .unwrap();

        let acme = TicketFilter::new().with_tenant("acme");
        assert_eq!(store.count(&acme).unwrap(), 2);
        assert_eq!(store.count(&acme.clone().with_status("open")).unwrap(), 1);
        assert_eq!(
            store.count(&acme.clone().with_urgency(Urgency::High)).unwrap(),
            1
        );
        assert_eq!(store.list(&acme.with_limit(1)).unwrap().len(), 1);
    }
}
