//! Sync triggers
//!
//! Two sources feed the uploader's single-flight guard: a periodic timer and
//! the reachability monitor's transitions to reachable.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::reachability::ReachabilityMonitor;
use crate::uploader::BatchUploader;

/// Running trigger sources. Stops them when dropped.
pub struct SyncTrigger {
    monitor: Arc<ReachabilityMonitor>,
    token: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl SyncTrigger {
    /// Start the periodic timer and the reachability listener.
    ///
    /// The first tick fires one full `interval` after start; ticks missed
    /// while the runtime was busy are skipped rather than bunched up.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        uploader: Arc<BatchUploader>,
        monitor: Arc<ReachabilityMonitor>,
        interval: Duration,
    ) -> Self {
        let token = CancellationToken::new();

        let periodic = Arc::downgrade(&uploader);
        let ticker = Self::spawn_periodic(token.clone(), interval, move || {
            if let Some(uploader) = periodic.upgrade() {
                tracing::trace!("Periodic sync tick");
                uploader.sync_now();
            }
        });

        let on_reachable = Arc::downgrade(&uploader);
        monitor.start_monitoring(move |reachable| {
            if !reachable {
                return;
            }
            if let Some(uploader) = on_reachable.upgrade() {
                tracing::debug!("Network became reachable, triggering sync");
                uploader.sync_now();
            }
        });

        tracing::info!(interval_secs = interval.as_secs_f64(), "Sync trigger started");

        Self {
            monitor,
            token,
            ticker: Mutex::new(Some(ticker)),
        }
    }

    fn spawn_periodic<F>(token: CancellationToken, interval: Duration, mut f: F) -> JoinHandle<()>
    where
        F: FnMut() + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => f(),
                }
            }
        })
    }

    /// Cancel the timer and stop monitoring. Safe to call repeatedly.
    pub fn stop(&self) {
        self.token.cancel();
        let ticker = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(ticker) = ticker {
            ticker.abort();
            self.monitor.stop_monitoring();
            tracing::info!("Sync trigger stopped");
        }
    }
}

impl Drop for SyncTrigger {
    fn drop(&mut self) {
        self.stop();
    }
}
