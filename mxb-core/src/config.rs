//! # Bridge Configuration
//!
//! Configuration is merged in the following order (later overrides earlier):
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Environment Variables           │
//! │    MXB_HOMESERVER_URL=https://...       │
//! ├─────────────────────────────────────────┤
//! │         Config File (mxb.toml)          │
//! │    [matrix]                             │
//! │    homeserver_url = "https://..."       │
//! ├─────────────────────────────────────────┤
//! │         Default Values                  │
//! └─────────────────────────────────────────┘
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "MXB";

/// Complete bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    #[serde(default)]
    pub matrix: MatrixConfig,

    #[serde(default)]
    pub appservice: AppServiceConfig,

    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    #[serde(default)]
    pub tracking: TrackingConfig,

    #[serde(default)]
    pub store: StoreConfig,

    /// Default log filter when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            matrix: MatrixConfig::default(),
            appservice: AppServiceConfig::default(),
            rate_limits: RateLimitConfig::default(),
            tracking: TrackingConfig::default(),
            store: StoreConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// Homeserver connection and identity settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatrixConfig {
    /// Client-server API base URL, e.g. `https://matrix.example.org`
    #[serde(default)]
    pub homeserver_url: String,

    /// Application-service token used as the bearer credential
    #[serde(default)]
    pub as_token: String,

    /// Manual server name override; skips well-known discovery when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,

    /// Localpart prefix of the ghost user namespace
    #[serde(default = "default_ghost_prefix")]
    pub ghost_prefix: String,

    /// Localpart prefix of room aliases reserved by the bridge
    #[serde(default = "default_alias_prefix")]
    pub alias_prefix: String,

    /// Localpart prefix of the secondary "bridge filter" alias
    #[serde(default = "default_filter_alias_prefix")]
    pub filter_alias_prefix: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Longest time an outbound call may wait on its rate limiter
    #[serde(default = "default_rate_wait_timeout")]
    pub rate_wait_timeout_secs: u64,

    /// Hard ceiling on downloaded media bodies
    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: usize,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            homeserver_url: String::new(),
            as_token: String::new(),
            server_name: None,
            ghost_prefix: default_ghost_prefix(),
            alias_prefix: default_alias_prefix(),
            filter_alias_prefix: default_filter_alias_prefix(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            rate_wait_timeout_secs: default_rate_wait_timeout(),
            max_download_bytes: default_max_download_bytes(),
        }
    }
}

impl MatrixConfig {
    pub fn new(homeserver_url: impl Into<String>, as_token: impl Into<String>) -> Self {
        Self {
            homeserver_url: homeserver_url.into(),
            as_token: as_token.into(),
            ..Default::default()
        }
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    pub fn with_ghost_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.ghost_prefix = prefix.into();
        self
    }

    pub fn with_request_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    pub fn with_rate_wait_timeout(mut self, secs: u64) -> Self {
        self.rate_wait_timeout_secs = secs;
        self
    }

    pub fn with_max_download_bytes(mut self, bytes: usize) -> Self {
        self.max_download_bytes = bytes;
        self
    }

    /// Base URL without a trailing slash
    pub fn base_url(&self) -> &str {
        self.homeserver_url.trim_end_matches('/')
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn rate_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.rate_wait_timeout_secs)
    }
}

/// Application-service webhook settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppServiceConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Token the homeserver presents on transaction pushes; unchecked when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hs_token: Option<String>,

    /// Largest accepted transaction body
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for AppServiceConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            hs_token: None,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl AppServiceConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Individual limit configuration
///
/// `interval_ms > 0` selects the fixed-interval limiter. Otherwise
/// `rate / per_seconds` tokens per second refill a bucket of `burst`.
/// A zero rate with no interval disables limiting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LimitConfig {
    #[serde(default)]
    pub rate: f64,
    #[serde(default = "default_per_seconds")]
    pub per_seconds: f64,
    #[serde(default)]
    pub burst: u32,
    #[serde(default)]
    pub interval_ms: u64,
}

impl LimitConfig {
    pub fn token_bucket(rate: f64, per_seconds: f64, burst: u32) -> Self {
        Self {
            rate,
            per_seconds,
            burst,
            interval_ms: 0,
        }
    }

    pub fn interval(interval: Duration) -> Self {
        Self {
            rate: 0.0,
            per_seconds: default_per_seconds(),
            burst: 0,
            interval_ms: interval.as_millis() as u64,
        }
    }

    pub fn disabled() -> Self {
        Self::token_bucket(0.0, default_per_seconds(), 0)
    }

    /// Tokens per second
    pub fn rate_per_second(&self) -> f64 {
        if self.per_seconds <= 0.0 {
            0.0
        } else {
            self.rate / self.per_seconds
        }
    }
}

/// Per-operation-class limits
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub message: LimitConfig,
    pub room_creation: LimitConfig,
    pub invite: LimitConfig,
    pub registration: LimitConfig,
    pub join: LimitConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            message: LimitConfig::token_bucket(5.0, 1.0, 20),
            room_creation: LimitConfig::interval(Duration::from_millis(1000)),
            invite: LimitConfig::token_bucket(2.0, 1.0, 5),
            registration: LimitConfig::token_bucket(1.0, 1.0, 5),
            join: LimitConfig::token_bucket(2.0, 1.0, 10),
        }
    }
}

impl RateLimitConfig {
    /// Every class disabled
    pub fn unlimited() -> Self {
        Self {
            message: LimitConfig::disabled(),
            room_creation: LimitConfig::disabled(),
            invite: LimitConfig::disabled(),
            registration: LimitConfig::disabled(),
            join: LimitConfig::disabled(),
        }
    }
}

/// Bookkeeping for transaction dedup and post edit tracking
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackingConfig {
    #[serde(default = "default_txn_retention")]
    pub transaction_retention_secs: u64,

    /// Run the ledger sweep every N recorded transactions
    #[serde(default = "default_txn_sweep_every")]
    pub transaction_sweep_every: u64,

    #[serde(default = "default_post_capacity")]
    pub post_tracker_capacity: usize,

    #[serde(default = "default_post_max_age")]
    pub post_tracker_max_age_secs: u64,

    #[serde(default = "default_post_cleanup_every")]
    pub post_tracker_cleanup_every: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            transaction_retention_secs: default_txn_retention(),
            transaction_sweep_every: default_txn_sweep_every(),
            post_tracker_capacity: default_post_capacity(),
            post_tracker_max_age_secs: default_post_max_age(),
            post_tracker_cleanup_every: default_post_cleanup_every(),
        }
    }
}

/// Trusted store location
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    /// SQLite file; the in-memory store is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl BridgeConfig {
    pub fn new(matrix: MatrixConfig) -> Self {
        Self {
            matrix,
            ..Default::default()
        }
    }

    /// Load with the full hierarchy: defaults, file (if present), environment
    pub fn load(path: Option<&Path>) -> BridgeResult<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(default_config_path);

        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };

        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file
    pub fn from_file(path: &Path) -> BridgeResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::config(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content).map_err(|e| {
            BridgeError::config(format!(
                "failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply `MXB_*` overrides. `lookup` is injected so tests need not touch
    /// the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> BridgeResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}_{}", ENV_PREFIX, name));

        if let Some(url) = var("HOMESERVER_URL") {
            self.matrix.homeserver_url = url;
        }
        if let Some(token) = var("AS_TOKEN") {
            self.matrix.as_token = token;
        }
        if let Some(token) = var("HS_TOKEN") {
            self.appservice.hs_token = Some(token);
        }
        if let Some(name) = var("SERVER_NAME") {
            self.matrix.server_name = Some(name);
        }
        if let Some(addr) = var("BIND_ADDRESS") {
            self.appservice.bind_address = addr;
        }
        if let Some(port) = var("PORT") {
            self.appservice.port = port
                .parse()
                .map_err(|_| BridgeError::config(format!("invalid {}_PORT: {}", ENV_PREFIX, port)))?;
        }
        if let Some(path) = var("STORE_PATH") {
            self.store.path = Some(PathBuf::from(path));
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(())
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> BridgeResult<()> {
        if self.matrix.homeserver_url.trim().is_empty() {
            return Err(BridgeError::config("matrix.homeserver_url is required"));
        }
        if !self.matrix.homeserver_url.starts_with("http://")
            && !self.matrix.homeserver_url.starts_with("https://")
        {
            return Err(BridgeError::config(
                "matrix.homeserver_url must start with http:// or https://",
            ));
        }
        if self.matrix.as_token.trim().is_empty() {
            return Err(BridgeError::config("matrix.as_token is required"));
        }
        if self.matrix.ghost_prefix.is_empty() {
            return Err(BridgeError::config("matrix.ghost_prefix cannot be empty"));
        }
        if self.appservice.max_body_bytes == 0 {
            return Err(BridgeError::config("appservice.max_body_bytes must be > 0"));
        }
        if self.tracking.post_tracker_capacity == 0 {
            return Err(BridgeError::config("tracking.post_tracker_capacity must be > 0"));
        }
        Ok(())
    }

    /// TOML rendering with tokens masked
    pub fn to_redacted_toml(&self) -> BridgeResult<String> {
        let mut copy = self.clone();
        if !copy.matrix.as_token.is_empty() {
            copy.matrix.as_token = "<redacted>".to_string();
        }
        if copy.appservice.hs_token.is_some() {
            copy.appservice.hs_token = Some("<redacted>".to_string());
        }
        toml::to_string_pretty(&copy).map_err(|e| BridgeError::Serialization(e.to_string()))
    }
}

/// `MXB_CONFIG`, then `./mxb.toml`, then the user config dir
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}_CONFIG", ENV_PREFIX)) {
        return PathBuf::from(path);
    }

    let candidates = [
        PathBuf::from("mxb.toml"),
        dirs::config_dir()
            .map(|d| d.join("mxb").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("/etc/mxb/config.toml")),
    ];

    for path in &candidates {
        if path.exists() {
            return path.clone();
        }
    }
    candidates[0].clone()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ghost_prefix() -> String {
    "_mattermost_".to_string()
}

fn default_alias_prefix() -> String {
    "_mattermost_".to_string()
}

fn default_filter_alias_prefix() -> String {
    "_mattermost_bridge_".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    30
}

fn default_rate_wait_timeout() -> u64 {
    30
}

fn default_max_download_bytes() -> usize {
    50 * 1024 * 1024
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8008
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_per_seconds() -> f64 {
    1.0
}

fn default_txn_retention() -> u64 {
    3600 // 1 hour
}

fn default_txn_sweep_every() -> u64 {
    100
}

fn default_post_capacity() -> usize {
    10_000
}

fn default_post_max_age() -> u64 {
    3600 // 1 hour
}

fn default_post_cleanup_every() -> u64 {
    500
}
