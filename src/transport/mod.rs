//! Transport strategies for reaching the monitoring device.
//!
//! Supports a persistent WebSocket push connection and HTTP polling. Both
//! implement [`VitalsTransport`], so callers can hold either behind the same
//! interface.

mod pull;
mod push;
mod retry;

pub use pull::*;
pub use push::*;
pub use retry::*;

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::buffer::ReadingStore;
use crate::config::{ClientConfig, ConfigError, EndpointHandle};
use crate::reading::{ConnectionState, Reading};
use crate::subscribe::{Handlers, Subscription};

/// Transport error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("malformed payload: {0}")]
    Decode(String),
    #[error("connection closed by device: {0}")]
    Closed(String),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl TransportError {
    /// Classify a reqwest error, given the timeout the request ran under.
    pub fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(timeout)
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if err.is_decode() {
            TransportError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            TransportError::Status(status.as_u16())
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                TransportError::Closed("socket already closed".to_string())
            }
            WsError::Io(e) => TransportError::Connect(e.to_string()),
            WsError::Http(resp) => TransportError::Status(resp.status().as_u16()),
            WsError::Url(e) => TransportError::Connect(e.to_string()),
            other => TransportError::Network(other.to_string()),
        }
    }
}

/// Which transport strategy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Persistent WebSocket; the device pushes frames.
    Push,
    /// HTTP polling of the device's `/vitals` endpoint.
    #[default]
    Pull,
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" | "ws" | "websocket" => Ok(TransportKind::Push),
            "pull" | "http" | "poll" => Ok(TransportKind::Pull),
            other => Err(ConfigError::UnknownTransport(other.to_string())),
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TransportKind::Push => "push",
            TransportKind::Pull => "pull",
        })
    }
}

/// Common contract of the push and pull clients.
///
/// Lifecycle methods spawn or cancel background tasks and must be called
/// from within a tokio runtime.
pub trait VitalsTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Buffer key this transport writes to.
    fn source(&self) -> &str;

    /// Replace the installed handler set as a whole.
    fn set_handlers(&self, handlers: Handlers) -> Subscription;

    /// Start connecting or polling. No-op if already running.
    fn connect(&self);

    /// Stop and cancel any pending retry. Idempotent. Fires `on_disconnect`
    /// if the device was connected; no other callback from the stopped
    /// session fires after this returns.
    fn disconnect(&self);

    /// Drop the current connection or poll loop and start a fresh one
    /// against the current endpoint.
    fn reconnect(&self);

    fn is_running(&self) -> bool;

    fn state(&self) -> ConnectionState;

    fn is_device_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Copy of this transport's buffered readings, oldest first.
    fn last_readings(&self) -> Vec<Reading>;
}

/// Build the transport selected by `cfg`.
pub fn build_transport(
    cfg: &ClientConfig,
    endpoint: EndpointHandle,
    store: ReadingStore,
) -> Result<Box<dyn VitalsTransport>, TransportError> {
    let transport: Box<dyn VitalsTransport> = match cfg.transport {
        TransportKind::Push => Box::new(PushClient::new(
            cfg.source.clone(),
            endpoint,
            store,
            cfg.push.clone(),
        )),
        TransportKind::Pull => Box::new(PullClient::new(
            cfg.source.clone(),
            endpoint,
            store,
            cfg.pull.clone(),
        )?),
    };
    Ok(transport)
}
