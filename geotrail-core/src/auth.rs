//! Bearer tokens for uploads
//!
//! The uploader asks its [`TokenProvider`] for a token on every send attempt,
//! so a rotated or expired token takes effect on the next retry.
//!
//! Tokens come from one of:
//! - nothing ([`NoToken`]): uploads carry only the `X-API-Key` header
//! - `[auth] token` ([`StaticToken`])
//! - an API key exchange ([`ApiKeyExchange`]): the key is posted to the
//!   auth endpoint once, and the returned token is cached on disk until it
//!   expires

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{AuthConfig, Config};
use crate::error::{Error, Result};
use crate::transport::TransportError;

/// Source of the `Authorization: Bearer` token
pub trait TokenProvider: Send + Sync {
    /// Current token, `None` to send the request without one
    fn auth_token(&self) -> Option<String>;
}

/// Uploads without a bearer token
#[derive(Debug, Clone, Copy, Default)]
pub struct NoToken;

impl TokenProvider for NoToken {
    fn auth_token(&self) -> Option<String> {
        None
    }
}

/// A fixed token that optionally stops being handed out after `expires_at`
#[derive(Debug, Clone)]
pub struct StaticToken {
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Token from the `[auth]` section, if one is configured
    pub fn from_config(auth: &AuthConfig) -> Option<Self> {
        let token = auth.token.as_ref().filter(|t| !t.is_empty())?;
        Some(Self {
            token: token.clone(),
            expires_at: auth.token_expires_at,
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }
}

impl TokenProvider for StaticToken {
    fn auth_token(&self) -> Option<String> {
        if self.is_expired_at(Utc::now()) {
            tracing::debug!("Auth token expired, uploading without it");
            return None;
        }
        Some(self.token.clone())
    }
}

/// Provider for the `[auth]` section: the configured token, or none
pub fn from_config(auth: &AuthConfig) -> Arc<dyn TokenProvider> {
    match StaticToken::from_config(auth) {
        Some(token) => Arc::new(token),
        None => Arc::new(NoToken),
    }
}

/// Provider for the whole configuration, exchanging the API key first when
/// `auth.exchange_api_key` is set.
///
/// A failed exchange is logged and uploads proceed without a bearer token.
pub async fn connect(config: &Config) -> Result<Arc<dyn TokenProvider>> {
    let Some(exchange) = ApiKeyExchange::from_config(config)? else {
        return Ok(from_config(&config.auth));
    };

    if let Err(e) = exchange.authenticate().await {
        tracing::warn!(error = %e, "API key exchange failed, uploading without a bearer token");
    }
    Ok(Arc::new(exchange))
}

/// A token issued by the auth endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl IssuedToken {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Serialize)]
struct ValidateRequest<'a> {
    api_key: &'a str,
    platform: &'static str,
    sdk_version: &'static str,
}

#[derive(Deserialize)]
struct ValidateResponse {
    token: String,
    expires_in: f64,
}

#[derive(Deserialize)]
struct ErrorResponse {
    message: String,
}

/// Longest lifetime accepted from the auth endpoint
const MAX_TOKEN_LIFETIME_SECS: f64 = 365.0 * 24.0 * 60.0 * 60.0;

/// Trades the API key for an expiring bearer token
pub struct ApiKeyExchange {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    cache_path: Option<PathBuf>,
    current: RwLock<Option<IssuedToken>>,
}

impl ApiKeyExchange {
    pub fn new(api_key: impl Into<String>, endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            cache_path: None,
            current: RwLock::new(None),
        })
    }

    /// Exchange configured by `[auth]`, cached under the XDG data directory.
    /// `None` unless `exchange_api_key` is set and an API key is present.
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        let api_key = match (&config.auth.api_key, config.auth.exchange_api_key) {
            (Some(api_key), true) if !api_key.is_empty() => api_key,
            _ => return Ok(None),
        };

        let exchange = Self::new(
            api_key.clone(),
            config.endpoints.auth_validate.clone(),
            config.sync.request_timeout(),
        )?
        .with_cache(Config::auth_token_cache_path());
        Ok(Some(exchange))
    }

    /// Persist issued tokens at `path`, starting from whatever is cached there
    pub fn with_cache(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match std::fs::read(&path) {
            Ok(data) => match serde_json::from_slice::<IssuedToken>(&data) {
                Ok(token) => {
                    tracing::debug!(expires_at = %token.expires_at, "Loaded cached auth token");
                    *self.current.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(token);
                }
                Err(e) => tracing::warn!(error = %e, path = %path.display(), "Ignoring unreadable auth token cache"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(error = %e, path = %path.display(), "Failed to read auth token cache"),
        }
        self.cache_path = Some(path);
        self
    }

    /// The last issued token, expired or not
    pub fn current(&self) -> Option<IssuedToken> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Post the API key to the auth endpoint unless a valid token is already held.
    pub async fn authenticate(&self) -> Result<()> {
        if self.current().is_some_and(|t| t.is_valid_at(Utc::now())) {
            tracing::debug!("Cached auth token still valid, skipping exchange");
            return Ok(());
        }

        let url = reqwest::Url::parse(&self.endpoint)
            .ok()
            .filter(|url| matches!(url.scheme(), "http" | "https"))
            .ok_or_else(|| TransportError::InvalidEndpoint(self.endpoint.clone()))?;

        let response = self
            .client
            .post(url)
            .header("X-API-Key", &self.api_key)
            .json(&ValidateRequest {
                api_key: &self.api_key,
                platform: std::env::consts::OS,
                sdk_version: env!("CARGO_PKG_VERSION"),
            })
            .send()
            .await
            .map_err(TransportError::from)?;

        let status = response.status();
        let body = response.bytes().await.map_err(TransportError::from)?;

        if !status.is_success() {
            let reason = serde_json::from_slice::<ErrorResponse>(&body)
                .map(|e| e.message)
                .unwrap_or_else(|_| format!("HTTP {}", status.as_u16()));
            return Err(Error::Auth(reason));
        }

        let issued: ValidateResponse = serde_json::from_slice(&body)
            .map_err(|e| Error::Auth(format!("failed to parse response: {}", e)))?;
        if !issued.expires_in.is_finite() || issued.expires_in <= 0.0 {
            return Err(Error::Auth(format!("invalid expires_in: {}", issued.expires_in)));
        }

        let lifetime_ms = (issued.expires_in.min(MAX_TOKEN_LIFETIME_SECS) * 1000.0) as i64;
        let token = IssuedToken {
            token: issued.token,
            expires_at: Utc::now() + chrono::Duration::milliseconds(lifetime_ms),
        };
        tracing::info!(expires_at = %token.expires_at, "API key exchanged for auth token");

        self.save_cache(&token).await;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(token);
        Ok(())
    }

    async fn save_cache(&self, token: &IssuedToken) {
        let Some(path) = &self.cache_path else {
            return;
        };
        let result = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let data = serde_json::to_vec(token)?;
            tokio::fs::write(path, data).await?;
            Ok::<_, Error>(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, path = %path.display(), "Failed to cache auth token");
        }
    }
}

impl TokenProvider for ApiKeyExchange {
    fn auth_token(&self) -> Option<String> {
        self.current()
            .filter(|t| t.is_valid_at(Utc::now()))
            .map(|t| t.token)
    }
}
