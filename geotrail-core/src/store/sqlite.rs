//! SQLite-backed queue store

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::DurableStore;
use crate::error::Result;
use crate::types::QueuedEvent;

/// Queue snapshot stored as one JSON row
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a queue database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        super::schema::run_migrations(&self.connection())
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DurableStore for SqliteStore {
    fn save(&self, events: &[QueuedEvent]) -> Result<()> {
        let payload = serde_json::to_string(events)?;
        self.connection().execute(
            r#"
            INSERT INTO event_queue (slot, payload, event_count, saved_at)
            VALUES (1, ?1, ?2, ?3)
            ON CONFLICT(slot) DO UPDATE SET
                payload = excluded.payload,
                event_count = excluded.event_count,
                saved_at = excluded.saved_at
            "#,
            params![payload, events.len() as i64, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn load(&self) -> Result<Option<Vec<QueuedEvent>>> {
        let payload: Option<String> = self
            .connection()
            .query_row("SELECT payload FROM event_queue WHERE slot = 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    fn clear(&self) -> Result<()> {
        self.connection()
            .execute("DELETE FROM event_queue WHERE slot = 1", [])?;
        Ok(())
    }

    fn last_saved_at(&self) -> Result<Option<DateTime<Utc>>> {
        let saved_at: Option<String> = self
            .connection()
            .query_row("SELECT saved_at FROM event_queue WHERE slot = 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        Ok(saved_at
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }
}
