//! Settings - the TOML configuration snapshot
//!
//! Loaded once at startup and passed by reference to whoever needs a slice of
//! it. There is no reload path.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::defaults;
use crate::cot::EventTemplate;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "INREACH_COT_CONFIG";

/// Config file looked up in the working directory when nothing else is given.
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration.
///
/// Load with [`Settings::load`], which searches:
/// 1. the explicit `--config` path
/// 2. `$INREACH_COT_CONFIG`
/// 3. `./config.toml`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    /// Where events are streamed
    #[serde(default)]
    pub tak_connection: TakConnectionConfig,

    /// Where positions come from
    #[serde(default)]
    pub feed: FeedConfig,

    /// How positions become CoT events
    #[serde(default)]
    pub cot: CotConfig,

    /// Worker cadence, queue sizing and failure handling
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

impl Settings {
    /// Resolve the config file path using the standard search order.
    pub fn locate(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        let mut tried = Vec::new();

        if let Some(path) = explicit {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            tried.push(path.to_path_buf());
        }

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                return Ok(p);
            }
            warn!(path = %path, "{} points to non-existent file", CONFIG_ENV_VAR);
            tried.push(p);
        }

        let local = PathBuf::from(DEFAULT_CONFIG_FILE);
        if local.exists() {
            return Ok(local);
        }
        tried.push(local);

        Err(ConfigError::NotFound(tried))
    }

    /// Locate and load the configuration.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = Self::locate(explicit)?;
        Self::load_from_file(&path)
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let settings = Self::from_toml(&contents, path)?;
        info!(
            path = %path.display(),
            feed = %settings.feed.url,
            mode = %settings.tak_connection.mode,
            "Loaded configuration"
        );
        Ok(settings)
    }

    /// Parse and validate TOML text. `origin` only labels errors.
    pub fn from_toml(contents: &str, origin: &Path) -> Result<Self, ConfigError> {
        // Two-pass: check for unknown keys first (warnings only)
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }

        let settings: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(origin.to_path_buf(), e))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the snapshot for internal consistency.
    ///
    /// A missing TAK host is not checked here; the binary reports it with its own exit path.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        let url = self.feed.url.trim();
        if url.is_empty() {
            errors.push("feed.url must be set".to_string());
        } else if !(url.starts_with("http://") || url.starts_with("https://")) {
            errors.push(format!("feed.url must be an http(s) URL, got '{url}'"));
        }
        if self.feed.request_timeout_secs == 0 {
            errors.push("feed.request_timeout_secs must be > 0".to_string());
        }

        if let Err(e) = self.event_template().validate() {
            errors.push(format!("cot: {e}"));
        }

        let d = &self.delivery;
        if d.queue_capacity == 0 {
            errors.push("delivery.queue_capacity must be > 0".to_string());
        }
        if d.max_consecutive_failures == 0 {
            errors.push("delivery.max_consecutive_failures must be > 0".to_string());
        }
        if d.backoff_initial_secs == 0 {
            errors.push("delivery.backoff_initial_secs must be > 0".to_string());
        }
        if d.backoff_initial_secs > d.backoff_max_secs {
            errors.push(format!(
                "delivery.backoff_initial_secs ({}) must not exceed backoff_max_secs ({})",
                d.backoff_initial_secs, d.backoff_max_secs
            ));
        }
        if d.max_cycles == Some(0) {
            errors.push("delivery.max_cycles must be > 0 when set".to_string());
        }

        let t = &self.tak_connection;
        if t.cert_pem.is_some() != t.cert_key.is_some() {
            errors.push("tak_connection.cert_pem and cert_key must be set together".to_string());
        }
        if t.cert_p12.is_some() && t.cert_pem.is_some() {
            errors.push("tak_connection.cert_p12 and cert_pem are mutually exclusive".to_string());
        }
        if t.connect_timeout_secs == 0 {
            errors.push("tak_connection.connect_timeout_secs must be > 0".to_string());
        }
        if matches!(&t.host, Some(h) if h.trim().is_empty()) {
            errors.push("tak_connection.host must not be blank".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// The builder's slice of the configuration.
    pub fn event_template(&self) -> EventTemplate {
        EventTemplate {
            event_type: self.cot.event_type.clone(),
            stale_secs: self.cot.stale_secs,
            uid_prefix: self.cot.uid_prefix.clone(),
        }
    }
}

// ============================================================================
// TAK Connection
// ============================================================================

/// How events travel to the TAK server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// CoT stream over TLS
    #[default]
    Tls,
    /// CoT stream over plain TCP
    Tcp,
    /// One datagram per event
    Udp,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportMode::Tls => write!(f, "tls"),
            TransportMode::Tcp => write!(f, "tcp"),
            TransportMode::Udp => write!(f, "udp"),
        }
    }
}

/// TAK server connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TakConnectionConfig {
    /// Server hostname or address. Required to run.
    #[serde(default)]
    pub host: Option<String>,

    /// Transport selector
    #[serde(default, rename = "type")]
    pub mode: TransportMode,

    #[serde(default = "default_tls_port")]
    pub tls: u16,

    #[serde(default = "default_tcp_port")]
    pub tcp: u16,

    #[serde(default = "default_udp_port")]
    pub udp: u16,

    /// Skip server certificate verification
    #[serde(default)]
    pub no_tls_verify: bool,

    /// Combined PKCS#12 client identity
    #[serde(default)]
    pub cert_p12: Option<PathBuf>,

    /// PEM client certificate (with `cert_key`)
    #[serde(default)]
    pub cert_pem: Option<PathBuf>,

    /// PEM client private key (with `cert_pem`)
    #[serde(default)]
    pub cert_key: Option<PathBuf>,

    /// Password for `cert_p12`
    #[serde(default)]
    pub password: Option<String>,

    /// PEM trust anchor for the server certificate; public roots when unset
    #[serde(default)]
    pub cert_ca: Option<PathBuf>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_tls_port() -> u16 {
    defaults::TAK_TLS_PORT
}
fn default_tcp_port() -> u16 {
    defaults::TAK_TCP_PORT
}
fn default_udp_port() -> u16 {
    defaults::TAK_UDP_PORT
}
fn default_connect_timeout() -> u64 {
    defaults::TAK_CONNECT_TIMEOUT_SECS
}

impl Default for TakConnectionConfig {
    fn default() -> Self {
        Self {
            host: None,
            mode: TransportMode::default(),
            tls: default_tls_port(),
            tcp: default_tcp_port(),
            udp: default_udp_port(),
            no_tls_verify: false,
            cert_p12: None,
            cert_pem: None,
            cert_key: None,
            password: None,
            cert_ca: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Resolved server address for the selected transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TakEndpoint {
    pub host: String,
    pub port: u16,
    pub mode: TransportMode,
}

impl std::fmt::Display for TakEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.mode, self.host, self.port)
    }
}

impl TakConnectionConfig {
    /// Port for the configured transport mode.
    pub fn port(&self) -> u16 {
        match self.mode {
            TransportMode::Tls => self.tls,
            TransportMode::Tcp => self.tcp,
            TransportMode::Udp => self.udp,
        }
    }

    /// `None` when no host is configured.
    pub fn endpoint(&self) -> Option<TakEndpoint> {
        let host = self.host.as_deref().map(str::trim).filter(|h| !h.is_empty())?;
        Some(TakEndpoint {
            host: host.to_string(),
            port: self.port(),
            mode: self.mode,
        })
    }

    /// Where the startup reachability check connects. UDP has no handshake,
    /// so the server's TCP input on the same host stands in for it.
    pub fn preflight_target(&self, endpoint: &TakEndpoint) -> TakEndpoint {
        match endpoint.mode {
            TransportMode::Udp => TakEndpoint {
                host: endpoint.host.clone(),
                port: self.tcp,
                mode: TransportMode::Tcp,
            },
            TransportMode::Tls | TransportMode::Tcp => endpoint.clone(),
        }
    }

    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.connect_timeout_secs)
    }
}

// ============================================================================
// Feed
// ============================================================================

/// Location feed settings.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// KML feed URL
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Seconds between polls; `0` polls again once the previous batch has drained
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_request_timeout() -> u64 {
    defaults::FEED_REQUEST_TIMEOUT_SECS
}
fn default_poll_interval() -> u64 {
    defaults::POLL_INTERVAL_SECS
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            password: String::new(),
            request_timeout_secs: default_request_timeout(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl FeedConfig {
    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}

// ============================================================================
// CoT
// ============================================================================

/// CoT event settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CotConfig {
    /// CoT type code, e.g. `a-f-G-U-C`
    #[serde(default, rename = "type")]
    pub event_type: String,

    #[serde(default = "default_stale_secs")]
    pub stale_secs: u32,

    #[serde(default = "default_uid_prefix")]
    pub uid_prefix: String,
}

fn default_stale_secs() -> u32 {
    defaults::COT_STALE_SECS
}
fn default_uid_prefix() -> String {
    defaults::COT_UID_PREFIX.to_string()
}

impl Default for CotConfig {
    fn default() -> Self {
        Self {
            event_type: String::new(),
            stale_secs: default_stale_secs(),
            uid_prefix: default_uid_prefix(),
        }
    }
}

// ============================================================================
// Delivery
// ============================================================================

/// What a failed poll cycle does to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Back off and poll again; give up after `max_consecutive_failures`
    #[default]
    Retry,
    /// Stop the worker on the first failed or empty cycle
    Terminate,
}

/// Worker delivery settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub on_failure: FailurePolicy,

    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,

    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_secs: u64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,

    /// Stop after this many successful cycles; unset runs forever
    #[serde(default)]
    pub max_cycles: Option<u64>,
}

fn default_queue_capacity() -> usize {
    defaults::OUTBOUND_QUEUE_CAPACITY
}
fn default_max_failures() -> u32 {
    defaults::MAX_CONSECUTIVE_FAILURES
}
fn default_backoff_initial() -> u64 {
    defaults::BACKOFF_INITIAL_SECS
}
fn default_backoff_max() -> u64 {
    defaults::BACKOFF_MAX_SECS
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            on_failure: FailurePolicy::default(),
            max_consecutive_failures: default_max_failures(),
            backoff_initial_secs: default_backoff_initial(),
            backoff_max_secs: default_backoff_max(),
            max_cycles: None,
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    NotFound(Vec<PathBuf>),
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, toml::de::Error),
    Validation(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NotFound(tried) => {
                write!(f, "No config file found (tried: ")?;
                for (i, p) in tried.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p.display())?;
                }
                write!(f, ")")
            }
            ConfigError::Io(path, e) => write!(f, "Config I/O error ({}): {}", path.display(), e),
            ConfigError::Parse(path, e) => {
                write!(f, "Config parse error ({}): {}", path.display(), e)
            }
            ConfigError::Validation(errors) => {
                writeln!(f, "Config validation failed:")?;
                for e in errors {
                    writeln!(f, "  - {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}
