//! Error types for geotrail-core

use thiserror::Error;

use crate::transport::TransportError;

/// Main error type for the geotrail-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Durable store error that doesn't map to a lower-level cause
    #[error("store error: {0}")]
    Store(String),

    /// The auth endpoint refused or garbled an API key exchange
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Upload transport error
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Result type alias for geotrail-core
pub type Result<T> = std::result::Result<T, Error>;
