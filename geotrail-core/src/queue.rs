//! Event queue
//!
//! An in-memory FIFO of [`QueuedEvent`]s guarded by a reader/writer lock:
//! `dequeue_batch` and `count` share the lock, every mutation takes it
//! exclusively. The queue mirrors itself into a [`DurableStore`]:
//!
//! - on `remove_batch` and `clear`
//! - on `enqueue` once the queue reaches its high watermark
//! - whenever `persist_to_disk` is called (lifecycle transitions)
//!
//! Store writes happen on a background persister task, never on the caller's
//! path. A persist request only raises a flag; the persister takes the
//! snapshot itself when it gets to the request, so any number of requests
//! made while a save is running collapse into one more save of the latest
//! state.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::config::QueueSettings;
use crate::store::DurableStore;
use crate::types::{LocationEvent, QueuedEvent};

/// Concurrency-safe, persistent event buffer
pub struct EventQueue {
    state: Arc<RwLock<QueueState>>,
    persister: Persister,
    high_watermark: usize,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<QueuedEvent>,
    ids: HashSet<Uuid>,
}

impl QueueState {
    fn from_persisted(events: Vec<QueuedEvent>) -> Self {
        let mut state = Self::default();
        for event in events {
            // First occurrence wins if an old snapshot carries duplicates
            if state.ids.insert(event.id()) {
                state.entries.push_back(event);
            }
        }
        state
    }

    fn snapshot(&self) -> Vec<QueuedEvent> {
        self.entries.iter().cloned().collect()
    }
}

impl EventQueue {
    /// Open a queue over `store`, loading whatever an earlier process persisted.
    ///
    /// Load failures are logged and the queue starts empty.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime; the persister task is
    /// spawned onto it.
    pub fn open(store: Arc<dyn DurableStore>, settings: &QueueSettings) -> Self {
        let state = match store.load() {
            Ok(Some(events)) => {
                let state = QueueState::from_persisted(events);
                tracing::info!(count = state.entries.len(), "Recovered persisted events");
                state
            }
            Ok(None) => QueueState::default(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load persisted event queue, starting empty");
                QueueState::default()
            }
        };

        let state = Arc::new(RwLock::new(state));
        Self {
            persister: Persister::spawn(store, state.clone()),
            state,
            high_watermark: settings.high_watermark.max(1),
        }
    }

    /// Append an event to the tail.
    ///
    /// Returns false if an event with the same id is already queued.
    pub fn enqueue(&self, event: LocationEvent) -> bool {
        let mut state = self.write();

        let id = event.id();
        if !state.ids.insert(id) {
            tracing::debug!(%id, "Event already queued, ignoring");
            return false;
        }
        state.entries.push_back(QueuedEvent::new(event));

        if state.entries.len() >= self.high_watermark {
            tracing::debug!(
                count = state.entries.len(),
                high_watermark = self.high_watermark,
                "Queue at high watermark, persisting"
            );
            self.persister.request_save();
        }
        true
    }

    /// Copy of the oldest `max_size` entries. Nothing is removed.
    pub fn dequeue_batch(&self, max_size: usize) -> Vec<QueuedEvent> {
        self.read().entries.iter().take(max_size).cloned().collect()
    }

    /// Remove every entry whose id appears in `batch`, then persist.
    ///
    /// Entries that are already gone are ignored. Returns how many were removed.
    pub fn remove_batch(&self, batch: &[QueuedEvent]) -> usize {
        let batch_ids: HashSet<Uuid> = batch.iter().map(QueuedEvent::id).collect();

        let mut state = self.write();
        let before = state.entries.len();
        state.entries.retain(|e| !batch_ids.contains(&e.id()));
        for id in &batch_ids {
            state.ids.remove(id);
        }
        let removed = before - state.entries.len();

        self.persister.request_save();
        removed
    }

    /// Bump the retry bookkeeping of the live entry matching `entry`.
    ///
    /// Returns false if the entry was removed in the meantime.
    pub fn update_retry_count(&self, entry: &QueuedEvent) -> bool {
        let id = entry.id();
        let mut state = self.write();
        match state.entries.iter_mut().find(|e| e.id() == id) {
            Some(live) => {
                live.mark_retried(Utc::now());
                true
            }
            None => false,
        }
    }

    /// Number of pending entries
    pub fn count(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Copy of every pending entry, oldest first
    pub fn entries(&self) -> Vec<QueuedEvent> {
        self.read().snapshot()
    }

    /// Drop everything, in memory and in the store
    pub fn clear(&self) {
        let mut state = self.write();
        state.entries.clear();
        state.ids.clear();
        self.persister.clear();
    }

    /// Queue a write of the current state to the store. Does not block.
    pub fn persist_to_disk(&self) {
        self.persister.request_save();
    }

    /// Resolves once every persist request issued before this call has reached the store.
    pub async fn wait_persisted(&self) {
        let (tx, rx) = oneshot::channel();
        self.persister.send(PersistCommand::Barrier(tx));
        let _ = rx.await;
    }

    fn read(&self) -> RwLockReadGuard<'_, QueueState> {
        read_state(&self.state)
    }

    fn write(&self) -> RwLockWriteGuard<'_, QueueState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn read_state(state: &RwLock<QueueState>) -> RwLockReadGuard<'_, QueueState> {
    state.read().unwrap_or_else(PoisonError::into_inner)
}

enum PersistCommand {
    Save,
    Clear,
    Barrier(oneshot::Sender<()>),
}

/// Handle to the background task that owns all store I/O
struct Persister {
    tx: mpsc::UnboundedSender<PersistCommand>,
    save_pending: Arc<AtomicBool>,
}

impl Persister {
    fn spawn(store: Arc<dyn DurableStore>, state: Arc<RwLock<QueueState>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let save_pending = Arc::new(AtomicBool::new(false));
        tokio::spawn(run_persister(store, state, save_pending.clone(), rx));
        Self { tx, save_pending }
    }

    /// At most one save is waiting in the channel at any time
    fn request_save(&self) {
        if !self.save_pending.swap(true, Ordering::AcqRel) {
            self.send(PersistCommand::Save);
        }
    }

    fn clear(&self) {
        self.send(PersistCommand::Clear);
    }

    fn send(&self, command: PersistCommand) {
        if self.tx.send(command).is_err() {
            tracing::warn!("Queue persister has stopped, dropping persist request");
        }
    }
}

async fn run_persister(
    store: Arc<dyn DurableStore>,
    state: Arc<RwLock<QueueState>>,
    save_pending: Arc<AtomicBool>,
    mut rx: mpsc::UnboundedReceiver<PersistCommand>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            PersistCommand::Save => {
                let target = store.clone();
                let state = state.clone();
                let pending = save_pending.clone();
                let result = tokio::task::spawn_blocking(move || {
                    // Lowered before the snapshot so a mutation racing with it queues another save
                    pending.store(false, Ordering::Release);
                    let events = read_state(&state).snapshot();
                    target.save(&events).map(|()| events.len())
                })
                .await;
                match result {
                    Ok(Ok(count)) => tracing::trace!(count, "Persisted event queue"),
                    Ok(Err(e)) => tracing::warn!(error = %e, "Failed to persist event queue"),
                    Err(e) => tracing::warn!(error = %e, "Persist task failed"),
                }
            }
            PersistCommand::Clear => {
                let target = store.clone();
                match tokio::task::spawn_blocking(move || target.clear()).await {
                    Ok(Ok(())) => tracing::debug!("Cleared persisted event queue"),
                    Ok(Err(e)) => tracing::warn!(error = %e, "Failed to clear persisted event queue"),
                    Err(e) => tracing::warn!(error = %e, "Clear task failed"),
                }
            }
            PersistCommand::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
}
