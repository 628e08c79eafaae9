//! Upload transport
//!
//! The uploader hands a batch to a [`Transport`] and only cares whether it
//! was delivered. Every failure, whatever its cause, goes down the same retry
//! path, so [`TransportError`] exists for logging rather than branching.

mod http;

pub use http::{build_metadata, encode_body, EncodedBody, HttpTransport};

use async_trait::async_trait;
use thiserror::Error;

use crate::types::QueuedEvent;

/// Why a batch was not delivered
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to encode payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to compress payload: {0}")]
    Compression(#[from] std::io::Error),
}

/// Delivers one batch to the collection endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `batch` to `endpoint`.
    ///
    /// `compressed` allows the body to be compressed; the transport decides
    /// whether it is worth it.
    async fn send(
        &self,
        batch: &[QueuedEvent],
        endpoint: &str,
        auth_token: Option<&str>,
        compressed: bool,
    ) -> Result<(), TransportError>;
}
