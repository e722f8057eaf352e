//! Configuration for the vitals client.
//!
//! [`EndpointConfig`] is the device address shared by both transports,
//! [`EndpointHandle`] makes it mutable at runtime, and [`ClientConfig`] loads
//! everything else from environment variables with sensible defaults.

use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use url::Url;

use crate::buffer::DEFAULT_CAPACITY;
use crate::transport::TransportKind;

/// Address used when nothing is configured.
pub const DEFAULT_DEVICE_ADDRESS: &str = "localhost:81";

/// Configuration error types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("device address is empty")]
    EmptyAddress,
    #[error("invalid device address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("unsupported scheme {0:?} (expected http, https, ws or wss)")]
    UnsupportedScheme(String),
    #[error("device address {0:?} has no host")]
    MissingHost(String),
    #[error("unknown transport {0:?} (expected push or pull)")]
    UnknownTransport(String),
}

/// URL scheme of a device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
    Ws,
    Wss,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, Scheme::Https | Scheme::Wss)
    }

    fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            "ws" => Ok(Scheme::Ws),
            "wss" => Ok(Scheme::Wss),
            other => Err(ConfigError::UnsupportedScheme(other.to_string())),
        }
    }
}

/// Device base address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub scheme: Scheme,
    pub host: String,
    pub port: Option<u16>,
    pub path: Option<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            scheme: Scheme::Http,
            host: "localhost".to_string(),
            port: Some(81),
            path: None,
        }
    }
}

impl EndpointConfig {
    /// Parse an address in any of the accepted forms: `host[:port]`,
    /// `http://host[:port]`, `https://...`, `ws://host[:port][/path]`,
    /// `wss://...`. Bare addresses default to `http`.
    pub fn parse(address: &str) -> Result<Self, ConfigError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(ConfigError::EmptyAddress);
        }

        let with_scheme = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };

        let url = Url::parse(&with_scheme).map_err(|e| ConfigError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

        let scheme = Scheme::parse(url.scheme())?;
        let host = match url.host_str() {
            Some(h) if !h.is_empty() => h.to_string(),
            _ => return Err(ConfigError::MissingHost(address.to_string())),
        };
        let path = match url.path() {
            "" | "/" => None,
            p => Some(p.to_string()),
        };

        Ok(Self {
            scheme,
            host,
            port: url.port(),
            path,
        })
    }

    fn authority(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }

    /// `http[s]://host[:port]`, path discarded.
    pub fn http_base(&self) -> String {
        let scheme = if self.scheme.is_secure() { "https" } else { "http" };
        format!("{}://{}", scheme, self.authority())
    }

    /// `ws[s]://host[:port][/path]`.
    pub fn ws_url(&self) -> String {
        let scheme = if self.scheme.is_secure() { "wss" } else { "ws" };
        format!(
            "{}://{}{}",
            scheme,
            self.authority(),
            self.path.as_deref().unwrap_or("")
        )
    }
}

impl fmt::Display for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}{}",
            self.scheme.as_str(),
            self.authority(),
            self.path.as_deref().unwrap_or("")
        )
    }
}

/// Shared, runtime-mutable endpoint.
///
/// Clones refer to the same endpoint. Transports watch it and restart their
/// connection or poll loop whenever it changes.
#[derive(Clone)]
pub struct EndpointHandle {
    tx: Arc<watch::Sender<EndpointConfig>>,
}

impl fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EndpointHandle").field(&*self.tx.borrow()).finish()
    }
}

impl Default for EndpointHandle {
    fn default() -> Self {
        Self::new(EndpointConfig::default())
    }
}

impl EndpointHandle {
    pub fn new(config: EndpointConfig) -> Self {
        let (tx, _) = watch::channel(config);
        Self { tx: Arc::new(tx) }
    }

    pub fn parse(address: &str) -> Result<Self, ConfigError> {
        EndpointConfig::parse(address).map(Self::new)
    }

    pub fn current(&self) -> EndpointConfig {
        self.tx.borrow().clone()
    }

    /// Replace the endpoint. Returns true if it changed.
    pub fn set(&self, config: EndpointConfig) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == config {
                return false;
            }
            *current = config;
            true
        })
    }

    /// Parse and install a new address. Invalid input leaves the endpoint
    /// untouched.
    pub fn set_address(&self, address: &str) -> Result<bool, ConfigError> {
        let config = EndpointConfig::parse(address)?;
        Ok(self.set(config))
    }

    /// Receiver that sees every later change.
    pub fn subscribe(&self) -> watch::Receiver<EndpointConfig> {
        self.tx.subscribe()
    }
}

/// Push transport tuning.
#[derive(Debug, Clone)]
pub struct PushSettings {
    /// Fixed delay between reconnection attempts (default: 5s)
    pub reconnect_interval: Duration,
    /// Upper bound on one connection handshake (default: 10s)
    pub connect_timeout: Duration,
    /// Name sent in the greeting frame after connecting
    pub client_name: String,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            client_name: "vitals-feed".to_string(),
        }
    }
}

/// Pull transport tuning.
#[derive(Debug, Clone)]
pub struct PullSettings {
    /// Delay between successful polls (default: 1s)
    pub poll_interval: Duration,
    /// Samples requested per poll (default: 20)
    pub samples: usize,
    /// Hard bound on a single request (default: 5s)
    pub request_timeout: Duration,
    /// Consecutive failures before the device is declared unreachable (default: 5)
    pub max_consecutive_errors: u32,
    /// Ceiling for the failure backoff (default: 10s)
    pub max_backoff: Duration,
}

impl Default for PullSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            samples: 20,
            request_timeout: Duration::from_secs(5),
            max_consecutive_errors: 5,
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: EndpointConfig,
    pub transport: TransportKind,
    /// Buffer key for readings (device or patient id)
    pub source: String,
    pub buffer_capacity: usize,
    pub push: PushSettings,
    pub pull: PullSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            transport: TransportKind::Pull,
            source: "device".to_string(),
            buffer_capacity: DEFAULT_CAPACITY,
            push: PushSettings::default(),
            pull: PullSettings::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `VITALS_DEVICE_ADDRESS`: device address (default: "localhost:81")
    /// - `VITALS_TRANSPORT`: "push" or "pull" (default: "pull")
    /// - `VITALS_SOURCE`: buffer key (default: "device")
    /// - `VITALS_BUFFER_CAPACITY`: readings kept (default: 1000)
    /// - `VITALS_POLL_INTERVAL_MS`, `VITALS_SAMPLES`, `VITALS_REQUEST_TIMEOUT_MS`,
    ///   `VITALS_MAX_ERRORS`, `VITALS_MAX_BACKOFF_MS`: pull tuning
    /// - `VITALS_RECONNECT_INTERVAL_MS`, `VITALS_CONNECT_TIMEOUT_MS`: push tuning
    ///
    /// Unparseable numbers keep their defaults; an invalid address or
    /// transport is an error.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        let address = lookup("VITALS_DEVICE_ADDRESS")
            .unwrap_or_else(|| DEFAULT_DEVICE_ADDRESS.to_string());
        cfg.endpoint = EndpointConfig::parse(&address)?;

        if let Some(kind) = lookup("VITALS_TRANSPORT") {
            cfg.transport = kind.parse()?;
        }
        if let Some(source) = lookup("VITALS_SOURCE").filter(|s| !s.trim().is_empty()) {
            cfg.source = source.trim().to_string();
        }
        if let Some(n) = parse_num(&lookup, "VITALS_BUFFER_CAPACITY") {
            cfg.buffer_capacity = n;
        }

        if let Some(ms) = parse_num(&lookup, "VITALS_POLL_INTERVAL_MS") {
            cfg.pull.poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse_num(&lookup, "VITALS_SAMPLES") {
            cfg.pull.samples = n;
        }
        if let Some(ms) = parse_num(&lookup, "VITALS_REQUEST_TIMEOUT_MS") {
            cfg.pull.request_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse_num(&lookup, "VITALS_MAX_ERRORS") {
            cfg.pull.max_consecutive_errors = n;
        }
        if let Some(ms) = parse_num(&lookup, "VITALS_MAX_BACKOFF_MS") {
            cfg.pull.max_backoff = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_num(&lookup, "VITALS_RECONNECT_INTERVAL_MS") {
            cfg.push.reconnect_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_num(&lookup, "VITALS_CONNECT_TIMEOUT_MS") {
            cfg.push.connect_timeout = Duration::from_millis(ms);
        }

        Ok(cfg)
    }
}

/// Parse a positive number, ignoring zero and garbage.
pub(crate) fn parse_num<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let value = lookup(key)?;
    match value.trim().parse::<T>() {
        Ok(n) if n > T::default() => Some(n),
        _ => {
            tracing::warn!("Ignoring invalid value for {}: {:?}", key, value);
            None
        }
    }
}
