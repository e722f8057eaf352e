//! HTTP polling transport.
//!
//! Polls `GET {base}/vitals?samples=N` on a self-rescheduling tokio task.
//! Consecutive failures back off exponentially from the poll interval; once
//! the failure threshold is reached while connected, the device is declared
//! unreachable. The loop itself only ever ends through [`PullClient::stop`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use super::{RetryPolicy, TransportError, TransportKind, VitalsTransport};
use crate::buffer::ReadingStore;
use crate::config::{ConfigError, EndpointConfig, EndpointHandle, PullSettings};
use crate::normalize::{normalize_payload, FieldSet, Normalized};
use crate::reading::{ConnectionState, Reading};
use crate::subscribe::{Dispatcher, Handlers, Subscription};

/// Device health as reported by `GET /status`.
///
/// Firmware builds disagree on field names, so the common ones are accepted
/// under several spellings and everything else is kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    /// Seconds since the device booted.
    #[serde(default)]
    pub uptime: Option<f64>,
    /// Wi-Fi RSSI in dBm.
    #[serde(default, alias = "rssi", alias = "signal")]
    pub signal_strength: Option<f64>,
    /// Samples waiting in the device's own buffer.
    #[serde(default, alias = "bufferSize", alias = "buffer")]
    pub buffer_state: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Error count and deduplication cursor for the poll loop.
#[derive(Debug, Default)]
struct Progress {
    consecutive_errors: u32,
    last_timestamp: Option<i64>,
}

impl Progress {
    fn reset(&mut self) {
        *self = Progress::default();
    }

    /// Keep only readings newer than everything accepted so far.
    fn accept_newer(&mut self, readings: Vec<Reading>) -> Vec<Reading> {
        let mut fresh = Vec::with_capacity(readings.len());
        for r in readings {
            if self.last_timestamp.map_or(true, |last| r.timestamp > last) {
                self.last_timestamp = Some(r.timestamp);
                fresh.push(r);
            }
        }
        fresh
    }
}

struct PullInner {
    source: String,
    endpoint: EndpointHandle,
    store: ReadingStore,
    settings: PullSettings,
    http: reqwest::Client,
    dispatcher: Dispatcher,
    task: Mutex<Option<JoinHandle<()>>>,
    progress: Mutex<Progress>,
}

/// Polling client for devices exposing an HTTP query endpoint.
pub struct PullClient {
    inner: Arc<PullInner>,
}

impl PullClient {
    /// Create an idle client. Call [`PullClient::start`] to begin polling.
    pub fn new(
        source: impl Into<String>,
        endpoint: EndpointHandle,
        store: ReadingStore,
        settings: PullSettings,
    ) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(PullInner {
                source: source.into(),
                endpoint,
                store,
                settings,
                http,
                dispatcher: Dispatcher::new(),
                task: Mutex::new(None),
                progress: Mutex::new(Progress::default()),
            }),
        })
    }

    /// Start polling. No-op if already polling.
    pub fn start(&self) {
        let inner = &self.inner;
        inner.dispatcher.exclusive(|| {
            if self.is_polling() {
                return;
            }
            tracing::info!(
                "Starting HTTP polling of {} every {:?}",
                inner.endpoint.current().http_base(),
                inner.settings.poll_interval
            );
            inner.spawn_loop();
        });
    }

    /// Stop polling and discard any in-flight request.
    ///
    /// Fires `on_disconnect` if the device was connected; no callback fires
    /// after this returns.
    pub fn stop(&self) {
        let inner = &self.inner;
        inner.dispatcher.exclusive(|| {
            inner
                .dispatcher
                .with_current(|e| e.transition(ConnectionState::Disconnected));
            inner.dispatcher.end_session();
            if let Some(task) = inner.task.lock().take() {
                task.abort();
                tracing::info!("Stopped HTTP polling for {}", inner.source);
            }
        });
    }

    pub fn is_polling(&self) -> bool {
        self.inner
            .task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Point the client at a new device address.
    ///
    /// The address is normalized to `scheme://host[:port]`, dropping any
    /// path. The error counter and dedup cursor are reset, and a running loop
    /// is restarted so the very next request goes to the new address.
    pub fn set_base_url(&self, address: &str) -> Result<(), ConfigError> {
        let parsed = EndpointConfig::parse(address)?;
        let config = EndpointConfig {
            path: None,
            ..parsed
        };

        let inner = &self.inner;
        inner.dispatcher.exclusive(|| {
            inner.endpoint.set(config);
            inner.progress.lock().reset();
            if self.is_polling() {
                tracing::info!(
                    "Retargeting HTTP polling to {}",
                    inner.endpoint.current().http_base()
                );
                inner.spawn_loop();
            }
        });
        Ok(())
    }

    /// Current `scheme://host[:port]` being polled.
    pub fn base_url(&self) -> String {
        self.inner.endpoint.current().http_base()
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.inner.progress.lock().consecutive_errors
    }

    /// One-off fetch of up to `samples` readings.
    ///
    /// Does not touch the buffer, the handlers or the error counter.
    pub async fn fetch_vitals(&self, samples: usize) -> Result<Vec<Reading>, TransportError> {
        let base = self.base_url();
        let normalized = self.inner.fetch_vitals(&base, samples).await?;
        Ok(normalized.readings)
    }

    /// Fetch device health from `GET /status`.
    pub async fn fetch_status(&self) -> Result<DeviceStatus, TransportError> {
        let body = self.inner.get_text("/status").await?;
        serde_json::from_str(&body).map_err(|e| TransportError::Decode(e.to_string()))
    }

    /// Fetch the free-form device description from `GET /info`.
    pub async fn fetch_info(&self) -> Result<Value, TransportError> {
        let body = self.inner.get_text("/info").await?;
        serde_json::from_str(&body).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

impl Drop for PullClient {
    fn drop(&mut self) {
        self.stop();
    }
}

impl VitalsTransport for PullClient {
    fn kind(&self) -> TransportKind {
        TransportKind::Pull
    }

    fn source(&self) -> &str {
        &self.inner.source
    }

    fn set_handlers(&self, handlers: Handlers) -> Subscription {
        self.inner.dispatcher.set_handlers(handlers)
    }

    fn connect(&self) {
        self.start();
    }

    fn disconnect(&self) {
        self.stop();
    }

    fn reconnect(&self) {
        let inner = &self.inner;
        inner.dispatcher.exclusive(|| {
            inner
                .dispatcher
                .with_current(|e| e.transition(ConnectionState::Disconnected));
            self.stop();
            inner.progress.lock().consecutive_errors = 0;
            self.start();
        });
    }

    fn is_running(&self) -> bool {
        self.is_polling()
    }

    fn state(&self) -> ConnectionState {
        self.inner.dispatcher.state()
    }

    fn last_readings(&self) -> Vec<Reading> {
        self.inner.store.snapshot(&self.inner.source)
    }
}

impl PullInner {
    /// Start a new session and loop, replacing any running one.
    fn spawn_loop(self: &Arc<Self>) {
        let session = self.dispatcher.begin_session();
        let handle = tokio::spawn(run_poll_loop(self.clone(), session));
        if let Some(old) = self.task.lock().replace(handle) {
            old.abort();
        }
    }

    async fn get_text(&self, path_and_query: &str) -> Result<String, TransportError> {
        let url = format!("{}{}", self.endpoint.current().http_base(), path_and_query);
        self.get_url(&url).await
    }

    async fn get_url(&self, url: &str) -> Result<String, TransportError> {
        let timeout = self.settings.request_timeout;
        let request = async {
            let response = self
                .http
                .get(url)
                .header(ACCEPT, "application/json")
                .header(CACHE_CONTROL, "no-store")
                .send()
                .await
                .map_err(|e| TransportError::from_reqwest(e, timeout))?;

            if !response.status().is_success() {
                return Err(TransportError::Status(response.status().as_u16()));
            }

            response
                .text()
                .await
                .map_err(|e| TransportError::from_reqwest(e, timeout))
        };

        // The client timeout covers the request; this also bounds body reads.
        tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
    }

    async fn fetch_vitals(&self, base: &str, samples: usize) -> Result<Normalized, TransportError> {
        let url = format!("{}/vitals?samples={}", base, samples);
        let body = self.get_url(&url).await?;
        let normalized = normalize_payload(&body, FieldSet::Pull);
        if normalized.is_empty() && normalized.rejected > 0 {
            return Err(TransportError::Decode(format!(
                "{} malformed record(s) in /vitals response",
                normalized.rejected
            )));
        }
        Ok(normalized)
    }

    /// Returns the delay before the next poll, or `None` if the session ended.
    fn on_success(&self, session: u64, normalized: Normalized) -> Option<Duration> {
        if normalized.is_empty() {
            tracing::debug!("No samples from {} this tick", self.source);
            return self
                .dispatcher
                .is_live(session)
                .then_some(self.settings.poll_interval);
        }

        self.dispatcher.with_session(session, |emitter| {
            let fresh = {
                let mut progress = self.progress.lock();
                progress.consecutive_errors = 0;
                progress.accept_newer(normalized.readings)
            };

            if emitter.transition(ConnectionState::Connected) {
                tracing::info!("Connected to device via HTTP ({})", self.source);
            }

            if !fresh.is_empty() && emitter.is_live() {
                self.store.append(&self.source, &fresh);
                emitter.data(&fresh);
            }

            self.settings.poll_interval
        })
    }

    fn on_failure(
        &self,
        session: u64,
        err: TransportError,
        policy: &RetryPolicy,
    ) -> Option<Duration> {
        self.dispatcher.with_session(session, |emitter| {
            let errors = {
                let mut progress = self.progress.lock();
                progress.consecutive_errors = progress.consecutive_errors.saturating_add(1);
                progress.consecutive_errors
            };
            let max = self.settings.max_consecutive_errors;

            tracing::warn!("HTTP polling error ({}/{}) for {}: {}", errors, max, self.source, err);
            emitter.error(&err);

            if errors >= max && emitter.transition(ConnectionState::Disconnected) {
                tracing::warn!(
                    "Device for {} unreachable after {} consecutive errors",
                    self.source,
                    errors
                );
            }

            policy.delay_for(errors.saturating_sub(1))
        })
    }

    fn on_retarget(&self, session: u64) -> bool {
        self.dispatcher
            .with_session(session, |_| {
                self.progress.lock().reset();
                tracing::info!(
                    "Device address changed, polling {}",
                    self.endpoint.current().http_base()
                );
            })
            .is_some()
    }
}

/// Run the poll loop for one session.
async fn run_poll_loop(inner: Arc<PullInner>, session: u64) {
    let mut endpoint_rx = inner.endpoint.subscribe();
    let policy = RetryPolicy::exponential(inner.settings.poll_interval, inner.settings.max_backoff);

    loop {
        let base = endpoint_rx.borrow_and_update().http_base();

        let outcome = tokio::select! {
            result = inner.fetch_vitals(&base, inner.settings.samples) => Some(result),
            Ok(()) = endpoint_rx.changed() => None,
        };

        let delay = match outcome {
            Some(Ok(normalized)) => inner.on_success(session, normalized),
            Some(Err(e)) => inner.on_failure(session, e, &policy),
            None => {
                if !inner.on_retarget(session) {
                    break;
                }
                continue;
            }
        };

        let Some(delay) = delay else {
            break;
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            Ok(()) = endpoint_rx.changed() => {
                if !inner.on_retarget(session) {
                    break;
                }
            }
        }
    }
}
