//! HTTP transport for the batch endpoint
//!
//! `POST <endpoint>` with body `{"events": [...], "metadata": {...}}`. Bodies
//! larger than the compression threshold are gzipped and sent with
//! `Content-Encoding: gzip`. Any 2xx status is a delivery.

use std::collections::BTreeMap;
use std::io::Write;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use serde::Serialize;

use crate::config::{Config, MetadataConfig};
use crate::error::{Error, Result};
use crate::types::QueuedEvent;

use super::{Transport, TransportError};

#[derive(Serialize)]
struct BatchPayload<'a> {
    events: &'a [QueuedEvent],
    metadata: &'a BTreeMap<String, String>,
}

/// A serialized request body
#[derive(Debug)]
pub struct EncodedBody {
    pub bytes: Vec<u8>,
    /// Whether `bytes` is gzip-compressed
    pub gzip: bool,
}

/// Serialize a batch, gzipping it when allowed and larger than `threshold` bytes.
pub fn encode_body(
    batch: &[QueuedEvent],
    metadata: &BTreeMap<String, String>,
    allow_compression: bool,
    threshold: usize,
) -> std::result::Result<EncodedBody, TransportError> {
    let json = serde_json::to_vec(&BatchPayload {
        events: batch,
        metadata,
    })?;

    if !allow_compression || json.len() <= threshold {
        return Ok(EncodedBody {
            bytes: json,
            gzip: false,
        });
    }

    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::default());
    encoder.write_all(&json)?;
    Ok(EncodedBody {
        bytes: encoder.finish()?,
        gzip: true,
    })
}

/// Metadata block attached to every upload
pub fn build_metadata(config: &MetadataConfig) -> BTreeMap<String, String> {
    let mut metadata = config.extra.clone();
    metadata.insert("platform".to_string(), std::env::consts::OS.to_string());
    metadata.insert(
        "sdk_version".to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    );
    if let Some(app_version) = &config.app_version {
        metadata.insert("app_version".to_string(), app_version.clone());
    }
    metadata
}

/// reqwest-backed [`Transport`]
pub struct HttpTransport {
    http_client: reqwest::Client,
    metadata: BTreeMap<String, String>,
    compression_threshold: usize,
}

impl HttpTransport {
    /// Build a transport from configuration
    ///
    /// Returns an error if the API key is not a valid header value or the
    /// HTTP client cannot be created.
    pub fn new(config: &Config) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(api_key) = &config.auth.api_key {
            headers.insert(
                "X-API-Key",
                HeaderValue::from_str(api_key)
                    .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?,
            );
        }

        let http_client = reqwest::Client::builder()
            .timeout(config.sync.request_timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            metadata: build_metadata(&config.metadata),
            compression_threshold: config.sync.compression_threshold_bytes,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        batch: &[QueuedEvent],
        endpoint: &str,
        auth_token: Option<&str>,
        compressed: bool,
    ) -> std::result::Result<(), TransportError> {
        let url = reqwest::Url::parse(endpoint)
            .ok()
            .filter(|url| matches!(url.scheme(), "http" | "https"))
            .ok_or_else(|| TransportError::InvalidEndpoint(endpoint.to_string()))?;

        let body = encode_body(batch, &self.metadata, compressed, self.compression_threshold)?;

        let mut request = self.http_client.post(url);
        if body.gzip {
            request = request.header(CONTENT_ENCODING, "gzip");
        }
        if let Some(token) = auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.body(body.bytes).send().await?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(events = batch.len(), gzip = body.gzip, %status, "Batch delivered");
            Ok(())
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(TransportError::Status {
                status: status.as_u16(),
                body: error_text,
            })
        }
    }
}
