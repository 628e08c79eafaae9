//! # geotrail-core
//!
//! Reliable delivery of location telemetry.
//!
//! This library provides:
//! - A persistent, concurrency-safe event queue
//! - A batch uploader with retry, backoff and single-flight sync
//! - Network reachability monitoring
//! - Configuration, logging and durable storage (SQLite or JSON file)
//!
//! ## Architecture
//!
//! Events flow one way:
//! - **Enqueue:** the host appends [`LocationEvent`]s to the [`EventQueue`]
//! - **Trigger:** a timer, a reachability edge or a manual call asks for a sync
//! - **Upload:** the [`BatchUploader`] drains the queue batch by batch and
//!   removes each batch only after the server accepts it
//!
//! ## Example
//!
//! ```rust,no_run
//! use geotrail_core::{Config, EventType, LocationData, Pipeline, PipelineParts};
//!
//! # async fn run() -> geotrail_core::Result<()> {
//! let config = Config::load()?;
//! let pipeline = Pipeline::new(PipelineParts::from_config(config).await?)?;
//! pipeline.start();
//!
//! pipeline.enqueue(
//!     LocationData::new(37.7749, -122.4194, 5.0, "core_location"),
//!     EventType::Position,
//! );
//!
//! pipeline.shutdown().await;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use auth::{ApiKeyExchange, IssuedToken, NoToken, StaticToken, TokenProvider};
pub use config::Config;
pub use error::{Error, Result};
pub use pipeline::{LifecycleTransition, Pipeline, PipelineParts};
pub use queue::EventQueue;
pub use reachability::{
    Connectivity, FixedNetwork, InterfaceKind, ManualPathSource, NetworkPath, NetworkStatus,
    PathSource, PathStatus, ProbePathSource, ReachabilityMonitor,
};
pub use store::{DurableStore, JsonFileStore, MemoryStore, SqliteStore};
pub use transport::{HttpTransport, Transport, TransportError};
pub use trigger::SyncTrigger;
pub use types::*;
pub use uploader::{BatchUploader, SyncStats, UploaderState, UploaderStatus};

// Public modules
pub mod auth;
pub mod config;
pub mod error;
pub mod format;
pub mod logging;
pub mod pipeline;
pub mod queue;
pub mod reachability;
pub mod store;
pub mod transport;
pub mod trigger;
pub mod types;
pub mod uploader;
