//! Pipeline coordinator
//!
//! Owns one queue, reachability monitor, uploader and trigger, and exposes the
//! operations a host application needs: enqueue, manual sync, lifecycle
//! hooks and shutdown.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::auth::{self, TokenProvider};
use crate::config::Config;
use crate::error::Result;
use crate::queue::EventQueue;
use crate::reachability::{ManualPathSource, PathSource, ProbePathSource, ReachabilityMonitor};
use crate::store::{self, DurableStore};
use crate::transport::{HttpTransport, Transport};
use crate::trigger::SyncTrigger;
use crate::types::{EventType, LocationData, LocationEvent};
use crate::uploader::{BatchUploader, SyncStats, UploaderStatus};

/// Everything the pipeline is built from
pub struct PipelineParts {
    pub config: Config,
    pub store: Arc<dyn DurableStore>,
    pub transport: Arc<dyn Transport>,
    pub paths: Arc<dyn PathSource>,
    pub tokens: Arc<dyn TokenProvider>,
}

impl PipelineParts {
    /// Production wiring: the configured store, HTTP transport, a TCP probe
    /// for reachability and the configured bearer token (exchanging the API
    /// key for one first when enabled).
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn from_config(config: Config) -> Result<Self> {
        let store = store::open_default(&config)?;
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config)?);

        let paths: Arc<dyn PathSource> = match config.probe_host() {
            Some(host) => Arc::new(ProbePathSource::spawn(
                host,
                config.network.probe_port,
                Duration::from_secs(config.network.probe_interval_secs.max(1)),
                config.network.interface,
            )),
            None => {
                tracing::warn!(
                    endpoint = %config.endpoints.events_batch,
                    "No probe host available, network will be reported unreachable"
                );
                Arc::new(ManualPathSource::default())
            }
        };

        Ok(Self {
            tokens: auth::connect(&config).await?,
            config,
            store,
            transport,
            paths,
        })
    }
}

/// Host application lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleTransition {
    Background,
    Foreground,
    Terminate,
}

pub struct Pipeline {
    config: Config,
    queue: Arc<EventQueue>,
    monitor: Arc<ReachabilityMonitor>,
    uploader: Arc<BatchUploader>,
    trigger: Mutex<Option<SyncTrigger>>,
}

impl Pipeline {
    /// Validate the configuration, load the persisted queue and spawn the uploader.
    ///
    /// Nothing syncs on its own until [`Pipeline::start`] is called.
    /// Must be called from within a Tokio runtime.
    pub fn new(parts: PipelineParts) -> Result<Self> {
        let PipelineParts {
            config,
            store,
            transport,
            paths,
            tokens,
        } = parts;

        config.validate()?;

        let queue = Arc::new(EventQueue::open(store, &config.queue));
        let monitor = Arc::new(ReachabilityMonitor::new(paths));
        let uploader = Arc::new(BatchUploader::spawn(
            queue.clone(),
            transport,
            monitor.clone(),
            tokens,
            config.endpoints.events_batch.clone(),
            config.sync.clone(),
        ));

        tracing::info!(
            pending = queue.count(),
            endpoint = %config.endpoints.events_batch,
            batch_size = config.sync.batch_size,
            "Pipeline ready"
        );

        Ok(Self {
            config,
            queue,
            monitor,
            uploader,
            trigger: Mutex::new(None),
        })
    }

    /// Start periodic and reachability-driven sync. No-op if already started.
    pub fn start(&self) {
        let mut trigger = self.trigger.lock().unwrap_or_else(PoisonError::into_inner);
        if trigger.is_some() {
            return;
        }
        *trigger = Some(SyncTrigger::start(
            self.uploader.clone(),
            self.monitor.clone(),
            self.config.sync.sync_interval(),
        ));
    }

    pub fn enqueue(&self, location: LocationData, event_type: EventType) -> bool {
        self.enqueue_event(LocationEvent::new(location, event_type))
    }

    pub fn enqueue_event(&self, event: LocationEvent) -> bool {
        self.queue.enqueue(event)
    }

    pub fn sync_now(&self) {
        self.uploader.sync_now();
    }

    pub async fn sync_until_idle(&self) -> SyncStats {
        self.uploader.sync_until_idle().await
    }

    pub fn count(&self) -> usize {
        self.queue.count()
    }

    pub fn status(&self) -> UploaderStatus {
        self.uploader.status()
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn monitor(&self) -> &Arc<ReachabilityMonitor> {
        &self.monitor
    }

    pub fn uploader(&self) -> &Arc<BatchUploader> {
        &self.uploader
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Every transition persists the queue; background and foreground also sync.
    pub fn handle_lifecycle(&self, transition: LifecycleTransition) {
        tracing::debug!(?transition, pending = self.queue.count(), "Lifecycle transition");
        self.queue.persist_to_disk();
        match transition {
            LifecycleTransition::Background | LifecycleTransition::Foreground => {
                self.uploader.sync_now();
            }
            LifecycleTransition::Terminate => {}
        }
    }

    /// Stop triggers, let the uploader wind down, then flush the queue to the store.
    pub async fn shutdown(&self) {
        let trigger = self
            .trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(trigger) = trigger {
            trigger.stop();
        }

        self.uploader.shutdown().await;
        self.queue.persist_to_disk();
        self.queue.wait_persisted().await;

        tracing::info!(pending = self.queue.count(), "Pipeline shut down");
    }
}
