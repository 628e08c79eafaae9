//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/geotrail/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/geotrail/` (~/.config/geotrail/)
//! - Data: `$XDG_DATA_HOME/geotrail/` (~/.local/share/geotrail/)
//! - State/Logs: `$XDG_STATE_HOME/geotrail/` (~/.local/state/geotrail/)

use crate::error::{Error, Result};
use crate::reachability::InterfaceKind;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// API credentials
    #[serde(default)]
    pub auth: AuthConfig,

    /// Server endpoints
    #[serde(default)]
    pub endpoints: Endpoints,

    /// Upload policy
    #[serde(default)]
    pub sync: SyncSettings,

    /// Event queue settings
    #[serde(default)]
    pub queue: QueueSettings,

    /// Reachability probe settings
    #[serde(default)]
    pub network: NetworkSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Extra fields sent in every upload's metadata block
    #[serde(default)]
    pub metadata: MetadataConfig,

    /// Location providers, in priority order
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// API credentials
#[derive(Debug, Deserialize, Default, Clone)]
pub struct AuthConfig {
    /// API key sent as `X-API-Key`
    pub api_key: Option<String>,
    /// Bearer token sent as `Authorization`
    pub token: Option<String>,
    /// When the bearer token stops being valid
    pub token_expires_at: Option<DateTime<Utc>>,
    /// Trade `api_key` for a bearer token at `endpoints.auth_validate`
    #[serde(default)]
    pub exchange_api_key: bool,
}

/// Server endpoints
#[derive(Debug, Deserialize, Clone)]
pub struct Endpoints {
    /// Batch upload endpoint
    #[serde(default = "default_events_batch")]
    pub events_batch: String,

    /// API key exchange endpoint
    #[serde(default = "default_auth_validate")]
    pub auth_validate: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            events_batch: default_events_batch(),
            auth_validate: default_auth_validate(),
        }
    }
}

fn default_auth_validate() -> String {
    "https://api.nkwalk.com/api/v1/auth/validate".to_string()
}

fn default_events_batch() -> String {
    "https://api.nkwalk.com/api/v1/events/batch".to_string()
}

/// Upload policy consumed by the batch uploader.
///
/// The uploader takes this struct as-is; every field is resolved here.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SyncSettings {
    /// Events per upload
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Seconds between periodic sync attempts
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: f64,

    /// Retries of the same batch before deferring it to the next cycle
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Backoff before retry `n` is `multiplier ^ n` seconds
    #[serde(default = "default_backoff_multiplier")]
    pub retry_backoff_multiplier: f64,

    /// Gzip request bodies above `compression_threshold_bytes`
    #[serde(default = "default_true")]
    pub compression_enabled: bool,

    /// Only upload while on WiFi
    #[serde(default)]
    pub wifi_only_sync: bool,

    /// Minimum encoded body size before compression applies
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: usize,

    /// HTTP request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            sync_interval_secs: default_sync_interval(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_backoff_multiplier: default_backoff_multiplier(),
            compression_enabled: true,
            wifi_only_sync: false,
            compression_threshold_bytes: default_compression_threshold(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl SyncSettings {
    /// Validate settings, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config(
                "sync.batch_size must be at least 1".to_string(),
            ));
        }
        if !self.sync_interval_secs.is_finite()
            || self.sync_interval_secs <= 0.0
            || self.sync_interval_secs > MAX_SYNC_INTERVAL_SECS
        {
            return Err(Error::Config(format!(
                "sync.sync_interval_secs must be a positive number no larger than {}",
                MAX_SYNC_INTERVAL_SECS
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::Config(
                "sync.request_timeout_secs must be at least 1".to_string(),
            ));
        }
        if !self.retry_backoff_multiplier.is_finite() || self.retry_backoff_multiplier < 1.0 {
            return Err(Error::Config(
                "sync.retry_backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }

    /// Periodic sync interval, clamped to `MAX_SYNC_INTERVAL_SECS` for unvalidated settings
    pub fn sync_interval(&self) -> Duration {
        let max = Duration::from_secs_f64(MAX_SYNC_INTERVAL_SECS);
        Duration::try_from_secs_f64(self.sync_interval_secs)
            .map(|interval| interval.min(max))
            .unwrap_or(max)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Longest accepted periodic sync interval (one week)
pub const MAX_SYNC_INTERVAL_SECS: f64 = 7.0 * 24.0 * 60.0 * 60.0;

fn default_batch_size() -> usize {
    50
}

fn default_sync_interval() -> f64 {
    30.0
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_compression_threshold() -> usize {
    1024
}

fn default_request_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// Which durable store backs the event queue
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Sqlite,
    Json,
}

/// Event queue settings
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// Queue length at which every enqueue also spills to the store
    #[serde(default = "default_high_watermark")]
    pub high_watermark: usize,

    /// Store backend
    #[serde(default)]
    pub store: StoreKind,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            high_watermark: default_high_watermark(),
            store: StoreKind::default(),
        }
    }
}

fn default_high_watermark() -> usize {
    1000
}

/// Reachability probe settings (used when no platform path monitor feeds us)
#[derive(Debug, Deserialize, Clone)]
pub struct NetworkSettings {
    /// Host to open a TCP connection to; defaults to the batch endpoint host
    pub probe_host: Option<String>,

    #[serde(default = "default_probe_port")]
    pub probe_port: u16,

    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    /// Interface class reported while the probe succeeds
    #[serde(default)]
    pub interface: InterfaceKind,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            probe_host: None,
            probe_port: default_probe_port(),
            probe_interval_secs: default_probe_interval(),
            interface: InterfaceKind::default(),
        }
    }
}

fn default_probe_port() -> u16 {
    443
}

fn default_probe_interval() -> u64 {
    10
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,

    /// Per-component level overrides, e.g. `uploader = "debug"`
    #[serde(default)]
    pub components: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
            components: BTreeMap::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Extra upload metadata
#[derive(Debug, Deserialize, Default, Clone)]
pub struct MetadataConfig {
    /// Host application version, sent as `app_version`
    pub app_version: Option<String>,

    /// Free-form string pairs merged into the metadata block
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

/// Supported location provider kinds
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    GoogleMaps,
    CoreLocation,
    IndoorAtlas,
    Custom,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::GoogleMaps => "google_maps",
            ProviderKind::CoreLocation => "core_location",
            ProviderKind::IndoorAtlas => "indoor_atlas",
            ProviderKind::Custom => "custom",
        }
    }

    /// Whether an adapter for this kind exists
    pub fn is_supported(&self) -> bool {
        matches!(self, ProviderKind::GoogleMaps | ProviderKind::CoreLocation)
    }
}

/// One configured location provider
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,

    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub credentials: BTreeMap<String, String>,

    /// Provider-specific tuning (accuracy, distance filter, ...)
    #[serde(default)]
    pub settings: BTreeMap<String, toml::Value>,
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Validate everything the pipeline depends on
    pub fn validate(&self) -> Result<()> {
        self.sync.validate()?;

        if self.endpoints.events_batch.trim().is_empty() {
            return Err(Error::Config(
                "endpoints.events_batch must not be empty".to_string(),
            ));
        }
        if self.auth.exchange_api_key && self.auth.api_key.is_none() {
            return Err(Error::Config(
                "auth.exchange_api_key requires auth.api_key".to_string(),
            ));
        }
        if self.queue.high_watermark == 0 {
            return Err(Error::Config(
                "queue.high_watermark must be at least 1".to_string(),
            ));
        }
        crate::logging::filter_directives(&self.logging)?;
        Ok(())
    }

    /// First enabled provider, if its kind is supported.
    pub fn active_provider(&self) -> Result<&ProviderConfig> {
        let provider = self
            .providers
            .iter()
            .find(|p| p.enabled)
            .ok_or_else(|| Error::Config("no enabled location provider found".to_string()))?;

        if !provider.kind.is_supported() {
            return Err(Error::Config(format!(
                "{} provider is not yet supported; use 'google_maps' or 'core_location'",
                provider.kind.as_str()
            )));
        }

        Ok(provider)
    }

    /// Host the reachability probe should contact
    pub fn probe_host(&self) -> Option<String> {
        if let Some(host) = &self.network.probe_host {
            return Some(host.clone());
        }
        reqwest::Url::parse(&self.endpoints.events_batch)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/geotrail/config.toml` (~/.config/geotrail/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("geotrail").join("config.toml")
    }

    /// Returns the data directory path (for the queue store)
    ///
    /// `$XDG_DATA_HOME/geotrail/` (~/.local/share/geotrail/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("geotrail")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/geotrail/` (~/.local/state/geotrail/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("geotrail")
    }

    /// `$XDG_DATA_HOME/geotrail/queue.db`
    pub fn queue_database_path() -> PathBuf {
        Self::data_dir().join("queue.db")
    }

    /// `$XDG_DATA_HOME/geotrail/auth_token.json`
    pub fn auth_token_cache_path() -> PathBuf {
        Self::data_dir().join("auth_token.json")
    }

    /// `$XDG_DATA_HOME/geotrail/event_queue.json`
    pub fn queue_json_path() -> PathBuf {
        Self::data_dir().join("event_queue.json")
    }

    /// Log file written on `date` (UTC); files rotate daily
    ///
    /// `$XDG_STATE_HOME/geotrail/geotrail.YYYY-MM-DD.log`
    pub fn log_path(date: NaiveDate) -> PathBuf {
        Self::state_dir().join(format!("geotrail.{}.log", date.format("%Y-%m-%d")))
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
