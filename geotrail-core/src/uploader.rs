//! Batch uploader
//!
//! Drains the [`EventQueue`] through a [`Transport`], one batch at a time.
//!
//! ## Sync cycle
//!
//! 1. A trigger arrives (`sync_now`, periodic tick, reachability edge).
//!    It is dropped if a cycle is already running, the network is down, or
//!    `wifi_only_sync` is set and we are not on WiFi.
//! 2. The oldest `batch_size` events are copied out of the queue.
//! 3. The batch is sent. On failure it is re-sent after
//!    `retry_backoff_multiplier ^ attempt` seconds, up to
//!    `max_retry_attempts` retries.
//! 4. On success the batch is removed from the queue and, if anything is
//!    left, the next cycle starts right away. On exhaustion every event in
//!    the batch has its retry count bumped and stays queued for a later cycle.
//!
//! All of this state lives in one actor task. Sends and backoff timers run
//! on their own tasks and report back through the actor's command channel.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::TokenProvider;
use crate::config::SyncSettings;
use crate::queue::EventQueue;
use crate::reachability::NetworkStatus;
use crate::transport::{Transport, TransportError};
use crate::types::QueuedEvent;

/// Where the uploader is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploaderState {
    Idle,
    /// A send is in flight; `attempt` 0 is the first try
    Uploading { attempt: u32 },
    /// The last send failed; the retry timer is pending
    WaitingToRetry { attempt: u32 },
    Stopped,
}

impl UploaderState {
    /// True while a cycle owns the uploader
    pub fn is_syncing(&self) -> bool {
        matches!(
            self,
            UploaderState::Uploading { .. } | UploaderState::WaitingToRetry { .. }
        )
    }
}

/// Upload statistics
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SyncStats {
    /// Cycles that found work and started sending
    pub cycles: usize,
    /// Transport calls, retries included
    pub send_attempts: usize,
    /// Transport calls that failed
    pub send_failures: usize,
    pub batches_uploaded: usize,
    pub events_uploaded: usize,
    /// Batches that ran out of retries and were deferred
    pub batches_exhausted: usize,
    /// Triggers dropped by the entry guard
    pub triggers_skipped: usize,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Snapshot published on every state change
#[derive(Debug, Clone, PartialEq)]
pub struct UploaderStatus {
    pub state: UploaderState,
    pub stats: SyncStats,
}

/// Delay before retry number `attempt + 1`
pub fn backoff_delay(multiplier: f64, attempt: u32) -> Duration {
    let secs = multiplier.powi(attempt.min(i32::MAX as u32) as i32);
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

enum Command {
    SyncNow,
    WaitIdle(oneshot::Sender<SyncStats>),
    UploadFinished {
        batch: Vec<QueuedEvent>,
        attempt: u32,
        result: Result<(), TransportError>,
    },
    RetryDue,
}

/// Handle to the uploader actor
pub struct BatchUploader {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<UploaderStatus>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BatchUploader {
    /// Spawn the uploader actor.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        queue: Arc<EventQueue>,
        transport: Arc<dyn Transport>,
        network: Arc<dyn NetworkStatus>,
        tokens: Arc<dyn TokenProvider>,
        endpoint: String,
        settings: SyncSettings,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(UploaderStatus {
            state: UploaderState::Idle,
            stats: SyncStats::default(),
        });
        let cancel = CancellationToken::new();

        let actor = Actor {
            queue,
            transport,
            network,
            tokens,
            endpoint,
            settings,
            tx: tx.clone(),
            rx,
            cancel: cancel.clone(),
            status_tx,
            stats: SyncStats::default(),
            uploading: None,
            pending_retry: None,
            retry_timer: None,
            idle_waiters: Vec::new(),
            stopping: false,
        };
        let task = tokio::spawn(actor.run());

        Self {
            commands: tx,
            status,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Request a sync cycle. Returns immediately.
    pub fn sync_now(&self) {
        if self.commands.send(Command::SyncNow).is_err() {
            tracing::debug!("Uploader stopped, ignoring sync trigger");
        }
    }

    /// Request a sync cycle and wait until the uploader is idle again.
    ///
    /// Resolves after the drain finishes, the batch is deferred, or the
    /// trigger is skipped.
    pub async fn sync_until_idle(&self) -> SyncStats {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::SyncNow).is_err()
            || self.commands.send(Command::WaitIdle(tx)).is_err()
        {
            return self.status().stats;
        }
        match rx.await {
            Ok(stats) => stats,
            Err(_) => self.status().stats,
        }
    }

    pub fn status(&self) -> UploaderStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UploaderStatus> {
        self.status.clone()
    }

    /// Stop the uploader.
    ///
    /// A pending retry timer is cancelled. An in-flight send is allowed to
    /// finish; its result is applied but nothing further is started.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Uploader task failed");
            }
        }
    }
}

impl Drop for BatchUploader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Actor {
    queue: Arc<EventQueue>,
    transport: Arc<dyn Transport>,
    network: Arc<dyn NetworkStatus>,
    tokens: Arc<dyn TokenProvider>,
    endpoint: String,
    settings: SyncSettings,

    tx: mpsc::UnboundedSender<Command>,
    rx: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    status_tx: watch::Sender<UploaderStatus>,

    stats: SyncStats,
    /// Attempt number of the send in flight
    uploading: Option<u32>,
    /// Failed batch waiting for its retry timer, with the attempt that failed
    pending_retry: Option<(Vec<QueuedEvent>, u32)>,
    retry_timer: Option<JoinHandle<()>>,
    idle_waiters: Vec<oneshot::Sender<SyncStats>>,
    stopping: bool,
}

impl Actor {
    async fn run(mut self) {
        tracing::debug!(endpoint = %self.endpoint, "Uploader started");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !self.stopping => self.begin_stop(),
                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }

            if self.stopping && self.uploading.is_none() {
                break;
            }
            self.publish();
        }

        self.stopping = true;
        self.publish();
        tracing::debug!("Uploader stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::SyncNow => self.try_start_cycle(),
            Command::WaitIdle(waiter) => self.idle_waiters.push(waiter),
            Command::UploadFinished {
                batch,
                attempt,
                result,
            } => self.upload_finished(batch, attempt, result),
            Command::RetryDue => {
                self.retry_timer = None;
                if let Some((batch, attempt)) = self.pending_retry.take() {
                    self.start_upload(batch, attempt + 1);
                }
            }
        }
    }

    fn is_busy(&self) -> bool {
        self.uploading.is_some() || self.pending_retry.is_some()
    }

    fn try_start_cycle(&mut self) {
        if self.stopping {
            return;
        }
        if self.is_busy() {
            self.skip("sync already in flight");
            return;
        }
        if !self.network.is_reachable() {
            self.skip("network unreachable");
            return;
        }
        if self.settings.wifi_only_sync && !self.network.is_wifi() {
            self.skip("wifi-only sync and not on wifi");
            return;
        }

        let batch = self.queue.dequeue_batch(self.settings.batch_size);
        if batch.is_empty() {
            tracing::trace!("Queue empty, nothing to sync");
            return;
        }

        self.stats.cycles += 1;
        tracing::debug!(
            events = batch.len(),
            pending = self.queue.count(),
            "Starting sync cycle"
        );
        self.start_upload(batch, 0);
    }

    fn skip(&mut self, reason: &'static str) {
        self.stats.triggers_skipped += 1;
        tracing::debug!(reason, "Skipping sync trigger");
    }

    fn start_upload(&mut self, batch: Vec<QueuedEvent>, attempt: u32) {
        self.uploading = Some(attempt);
        self.stats.send_attempts += 1;

        let transport = self.transport.clone();
        let endpoint = self.endpoint.clone();
        let token = self.tokens.auth_token();
        let compressed = self.settings.compression_enabled;
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let result = transport
                .send(&batch, &endpoint, token.as_deref(), compressed)
                .await;
            let _ = tx.send(Command::UploadFinished {
                batch,
                attempt,
                result,
            });
        });
    }

    fn upload_finished(
        &mut self,
        batch: Vec<QueuedEvent>,
        attempt: u32,
        result: Result<(), TransportError>,
    ) {
        self.uploading = None;

        match result {
            Ok(()) => {
                let removed = self.queue.remove_batch(&batch);
                self.stats.batches_uploaded += 1;
                self.stats.events_uploaded += removed;
                self.stats.last_success_at = Some(Utc::now());
                tracing::info!(
                    events = removed,
                    attempt,
                    remaining = self.queue.count(),
                    "Uploaded batch"
                );

                if !self.queue.is_empty() {
                    self.try_start_cycle();
                }
            }
            Err(e) => {
                self.stats.send_failures += 1;
                self.stats.last_error = Some(e.to_string());

                if self.stopping {
                    tracing::warn!(error = %e, attempt, "Upload failed during shutdown");
                    self.defer(&batch);
                } else if attempt < self.settings.max_retry_attempts {
                    let delay = backoff_delay(self.settings.retry_backoff_multiplier, attempt);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        delay_secs = delay.as_secs_f64(),
                        "Upload failed, retrying"
                    );
                    self.schedule_retry(batch, attempt, delay);
                } else {
                    self.stats.batches_exhausted += 1;
                    tracing::warn!(
                        error = %e,
                        events = batch.len(),
                        attempts = attempt + 1,
                        "Upload retries exhausted, deferring batch"
                    );
                    self.defer(&batch);
                }
            }
        }
    }

    fn schedule_retry(&mut self, batch: Vec<QueuedEvent>, attempt: u32, delay: Duration) {
        let tx = self.tx.clone();
        self.retry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Command::RetryDue);
        }));
        self.pending_retry = Some((batch, attempt));
    }

    /// Leave the batch queued with its retry bookkeeping bumped
    fn defer(&self, batch: &[QueuedEvent]) {
        let updated = batch
            .iter()
            .filter(|event| self.queue.update_retry_count(event))
            .count();
        self.queue.persist_to_disk();
        tracing::debug!(events = batch.len(), updated, "Deferred batch");
    }

    fn begin_stop(&mut self) {
        self.stopping = true;

        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
        if let Some((batch, attempt)) = self.pending_retry.take() {
            tracing::info!(events = batch.len(), attempt, "Cancelled pending retry");
            self.defer(&batch);
        }
        if self.uploading.is_some() {
            tracing::info!("Waiting for in-flight upload before stopping");
        }
    }

    fn state(&self) -> UploaderState {
        if let Some(attempt) = self.uploading {
            UploaderState::Uploading { attempt }
        } else if let Some((_, attempt)) = &self.pending_retry {
            UploaderState::WaitingToRetry {
                attempt: attempt + 1,
            }
        } else if self.stopping {
            UploaderState::Stopped
        } else {
            UploaderState::Idle
        }
    }

    fn publish(&mut self) {
        let state = self.state();
        self.status_tx.send_if_modified(|current| {
            if current.state == state && current.stats == self.stats {
                false
            } else {
                *current = UploaderStatus {
                    state,
                    stats: self.stats.clone(),
                };
                true
            }
        });

        if !self.is_busy() {
            for waiter in self.idle_waiters.drain(..) {
                let _ = waiter.send(self.stats.clone());
            }
        }
    }
}
