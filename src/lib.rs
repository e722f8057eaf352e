//! vitals-feed - real-time vital-signs ingestion.
//!
//! Pulls ECG, PPG, heart-rate and SpO2 samples from a bedside monitoring
//! device either over a persistent WebSocket ([`PushClient`]) or by polling
//! its HTTP endpoint ([`PullClient`]), normalizes every wire shape into a
//! [`Reading`], keeps the most recent readings per source in a rolling
//! buffer and hands them to registered callbacks.
//!
//! ```no_run
//! use vitals_feed::{Handlers, Monitor, ClientConfig, TransportKind};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let monitor = Monitor::new(ClientConfig::load()?);
//! monitor.set_device_address("pat_001", "192.168.31.111:81")?;
//! monitor.activate(
//!     "pat_001",
//!     TransportKind::Pull,
//!     Handlers::new().on_data(|batch| println!("{} new readings", batch.len())),
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod monitor;
pub mod normalize;
pub mod reading;
pub mod simulator;
pub mod subscribe;
pub mod transport;

#[cfg(test)]
mod testing;

pub use buffer::{ReadingStore, RollingBuffer, DEFAULT_CAPACITY};
pub use config::{
    ClientConfig, ConfigError, EndpointConfig, EndpointHandle, PullSettings, PushSettings,
};
pub use monitor::Monitor;
pub use reading::{ConnectionState, Reading};
pub use subscribe::{Handlers, Subscription};
pub use transport::{
    build_transport, DeviceStatus, PullClient, PushClient, TransportError, TransportKind,
    VitalsTransport,
};
