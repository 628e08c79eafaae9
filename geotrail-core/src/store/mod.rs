//! Durable storage for the event queue
//!
//! The queue mirrors its whole in-memory state into a [`DurableStore`] as one
//! opaque snapshot. Every `save` overwrites the previous snapshot; nothing is
//! appended.
//!
//! Backends:
//! - [`SqliteStore`]: single-row table in a SQLite database (default)
//! - [`JsonFileStore`]: `event_queue.json`, replaced atomically on save
//! - [`MemoryStore`]: process-local, for tests and embedding without disk

mod file;
mod schema;
mod sqlite;

pub use file::JsonFileStore;
pub use sqlite::SqliteStore;

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::config::{Config, StoreKind};
use crate::error::Result;
use crate::types::QueuedEvent;

/// Persistence boundary that survives process restarts.
///
/// Implementations are called from a blocking context and may do synchronous I/O.
pub trait DurableStore: Send + Sync {
    /// Replace the persisted snapshot with `events`
    fn save(&self, events: &[QueuedEvent]) -> Result<()>;

    /// Load the persisted snapshot, `None` if nothing was ever saved
    fn load(&self) -> Result<Option<Vec<QueuedEvent>>>;

    /// Drop the persisted snapshot
    fn clear(&self) -> Result<()>;

    /// When the current snapshot was written, if the backend tracks it
    fn last_saved_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(None)
    }
}

/// Open the store selected by `config.queue.store` at its XDG location.
pub fn open_default(config: &Config) -> Result<Arc<dyn DurableStore>> {
    let store: Arc<dyn DurableStore> = match config.queue.store {
        StoreKind::Sqlite => {
            let store = SqliteStore::open(&Config::queue_database_path())?;
            store.migrate()?;
            Arc::new(store)
        }
        StoreKind::Json => Arc::new(JsonFileStore::new(Config::queue_json_path())),
    };
    Ok(store)
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    snapshot: Mutex<Option<Vec<QueuedEvent>>>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with a snapshot, as if saved by an earlier process
    pub fn with_events(events: Vec<QueuedEvent>) -> Self {
        Self {
            snapshot: Mutex::new(Some(events)),
            saves: Mutex::new(0),
        }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Option<Vec<QueuedEvent>> {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of `save` calls so far
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DurableStore for MemoryStore {
    fn save(&self, events: &[QueuedEvent]) -> Result<()> {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = Some(events.to_vec());
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }

    fn load(&self) -> Result<Option<Vec<QueuedEvent>>> {
        Ok(self.snapshot())
    }

    fn clear(&self) -> Result<()> {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}
