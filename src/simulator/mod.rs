//! Device simulator.
//!
//! An axum server that behaves like a bedside monitoring device: it answers
//! `/vitals`, `/status` and `/info` over HTTP and streams frames to WebSocket
//! clients on `/` and `/ws`. Responses to `/vitals` can be scripted, which
//! makes it the network fixture for the transport tests.

mod handlers;
mod waveform;

pub use waveform::Waveform;

use std::collections::VecDeque;
use std::env;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{routing::get, Router};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::parse_num;
use crate::normalize::now_millis;

/// One queued answer to `GET /vitals`.
#[derive(Debug, Clone)]
pub enum Scripted {
    Json(Value),
    /// Served as `text/plain`.
    Text(String),
    Status(u16),
    /// Hold the request open, then answer with an empty array.
    Stall(Duration),
}

/// What `/vitals` answers once the script is exhausted.
#[derive(Debug, Clone, Default)]
pub enum Fallback {
    /// Fresh waveform samples.
    #[default]
    Synthetic,
    /// An empty JSON array.
    Empty,
    Status(u16),
    Json(Value),
}

/// Simulator settings.
#[derive(Debug, Clone)]
pub struct SimulatorSettings {
    pub port: u16,
    pub sample_rate_hz: f64,
    pub heart_rate_bpm: f64,
    /// Push synthetic frames to WebSocket clients.
    pub stream_synthetic: bool,
    pub frame_interval: Duration,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            port: 81,
            sample_rate_hz: 250.0,
            heart_rate_bpm: 72.0,
            stream_synthetic: true,
            frame_interval: Duration::from_millis(40),
        }
    }
}

impl SimulatorSettings {
    /// Load settings from environment variables.
    ///
    /// Environment variables:
    /// - `VITALS_SIM_PORT`: listen port (default: 81)
    /// - `VITALS_SIM_RATE_HZ`: sample rate (default: 250)
    pub fn load() -> Self {
        let lookup = |key: &str| env::var(key).ok();
        let mut settings = Self::default();
        if let Some(port) = parse_num(&lookup, "VITALS_SIM_PORT") {
            settings.port = port;
        }
        if let Some(rate) = parse_num(&lookup, "VITALS_SIM_RATE_HZ") {
            settings.sample_rate_hz = rate;
        }
        settings
    }
}

/// Messages fanned out to connected WebSocket clients.
#[derive(Debug, Clone)]
pub(crate) enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// State shared across handlers.
pub(crate) struct SimState {
    settings: SimulatorSettings,
    started: Instant,
    script: Mutex<VecDeque<Scripted>>,
    fallback: Mutex<Fallback>,
    waveform: Mutex<Waveform>,
    requests: Mutex<Vec<String>>,
    vitals_requests: AtomicUsize,
    received: Mutex<Vec<String>>,
    outbound: broadcast::Sender<Outbound>,
    ws_clients: AtomicUsize,
}

impl SimState {
    fn record(&self, request: String) {
        tracing::debug!("Simulator request: {}", request);
        self.requests.lock().push(request);
    }
}

/// A device simulator that has not started listening yet.
pub struct DeviceSimulator {
    settings: SimulatorSettings,
    fallback: Fallback,
}

impl DeviceSimulator {
    pub fn new(settings: SimulatorSettings) -> Self {
        Self {
            settings,
            fallback: Fallback::default(),
        }
    }

    pub fn with_fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = fallback;
        self
    }

    fn routes(state: Arc<SimState>) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/vitals", get(handlers::handle_vitals))
            .route("/status", get(handlers::handle_status))
            .route("/info", get(handlers::handle_info))
            // WebSocket stream
            .route("/", get(handlers::handle_ws))
            .route("/ws", get(handlers::handle_ws))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Listen on `127.0.0.1` with an ephemeral port.
    pub async fn spawn_local(self) -> std::io::Result<SimulatorHandle> {
        self.spawn(SocketAddr::from(([127, 0, 0, 1], 0))).await
    }

    /// Listen on the configured port on all interfaces.
    pub async fn spawn_configured(self) -> std::io::Result<SimulatorHandle> {
        let port = self.settings.port;
        self.spawn(SocketAddr::from(([0, 0, 0, 0], port))).await
    }

    /// Bind `addr` and serve in the background.
    pub async fn spawn(self, addr: SocketAddr) -> std::io::Result<SimulatorHandle> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let (outbound, _) = broadcast::channel(256);
        let state = Arc::new(SimState {
            waveform: Mutex::new(Waveform::new(
                self.settings.sample_rate_hz,
                self.settings.heart_rate_bpm,
            )),
            settings: self.settings,
            started: Instant::now(),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(self.fallback),
            requests: Mutex::new(Vec::new()),
            vitals_requests: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
            outbound,
            ws_clients: AtomicUsize::new(0),
        });

        let router = Self::routes(state.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tracing::info!("Device simulator listening on {}", local_addr);
        let server = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                tracing::error!("Simulator server error: {}", e);
            }
        });

        let streamer = state
            .settings
            .stream_synthetic
            .then(|| tokio::spawn(stream_frames(state.clone())));

        Ok(SimulatorHandle {
            addr: local_addr,
            state,
            shutdown: Some(shutdown_tx),
            server: Some(server),
            streamer,
        })
    }
}

/// Push synthetic frames to every WebSocket client at a steady cadence.
async fn stream_frames(state: Arc<SimState>) {
    let mut ticker = tokio::time::interval(state.settings.frame_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if state.ws_clients.load(Ordering::SeqCst) == 0 {
            continue;
        }
        let readings = state.waveform.lock().catch_up(now_millis());
        if readings.is_empty() {
            continue;
        }
        match serde_json::to_string(&readings) {
            Ok(frame) => {
                let _ = state.outbound.send(Outbound::Text(frame));
            }
            Err(e) => tracing::warn!("Failed to encode frame: {}", e),
        }
    }
}

/// A running simulator.
pub struct SimulatorHandle {
    addr: SocketAddr,
    state: Arc<SimState>,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<()>>,
    streamer: Option<JoinHandle<()>>,
}

impl SimulatorHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `host:port`, usable as a device address.
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Queue a response for the next `/vitals` request.
    pub fn enqueue(&self, response: Scripted) {
        self.state.script.lock().push_back(response);
    }

    pub fn set_fallback(&self, fallback: Fallback) {
        *self.state.fallback.lock() = fallback;
    }

    /// Requests seen so far, as `path?query`.
    pub fn requests(&self) -> Vec<String> {
        self.state.requests.lock().clone()
    }

    pub fn vitals_requests(&self) -> usize {
        self.state.vitals_requests.load(Ordering::SeqCst)
    }

    /// Text messages received from WebSocket clients.
    pub fn received(&self) -> Vec<String> {
        self.state.received.lock().clone()
    }

    pub fn ws_clients(&self) -> usize {
        self.state.ws_clients.load(Ordering::SeqCst)
    }

    /// Send a text frame to every WebSocket client. Returns how many clients
    /// it was queued for.
    pub fn push_frame(&self, frame: impl Into<String>) -> usize {
        self.state.outbound.send(Outbound::Text(frame.into())).unwrap_or(0)
    }

    pub fn push_binary(&self, frame: Vec<u8>) -> usize {
        self.state.outbound.send(Outbound::Binary(frame)).unwrap_or(0)
    }

    /// Close every WebSocket connection from the device side.
    pub fn kick_clients(&self) {
        let _ = self.state.outbound.send(Outbound::Close);
    }

    /// Stop serving, waiting briefly for in-flight requests.
    pub async fn shutdown(&mut self) {
        self.kick_clients();
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(streamer) = self.streamer.take() {
            streamer.abort();
        }
        if let Some(mut server) = self.server.take() {
            if tokio::time::timeout(Duration::from_secs(2), &mut server).await.is_err() {
                server.abort();
            }
        }
        tracing::info!("Device simulator on {} stopped", self.addr);
    }
}

impl Drop for SimulatorHandle {
    fn drop(&mut self) {
        if let Some(streamer) = self.streamer.take() {
            streamer.abort();
        }
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn get(sim: &SimulatorHandle, path: &str) -> reqwest::Response {
        reqwest::get(format!("http://{}{}", sim.address(), path)).await.unwrap()
    }

    #[tokio::test]
    async fn test_script_then_fallback() {
        let sim = DeviceSimulator::new(SimulatorSettings::default())
            .with_fallback(Fallback::Status(503))
            .spawn_local()
            .await
            .unwrap();
        sim.enqueue(Scripted::Json(json!([{"ts": 1, "ecg": 0.5}])));

        let first = get(&sim, "/vitals?samples=3").await;
        assert_eq!(first.status(), 200);
        let body: Value = first.json().await.unwrap();
        assert_eq!(body[0]["ecg"], 0.5);

        assert_eq!(get(&sim, "/vitals").await.status(), 503);
        assert_eq!(sim.vitals_requests(), 2);
        assert_eq!(sim.requests(), vec!["/vitals?samples=3", "/vitals"]);
    }

    #[tokio::test]
    async fn test_synthetic_vitals_honor_sample_count() {
        let sim = DeviceSimulator::new(SimulatorSettings::default())
            .spawn_local()
            .await
            .unwrap();

        let body: Vec<Value> = get(&sim, "/vitals?samples=7").await.json().await.unwrap();
        assert_eq!(body.len(), 7);
        assert!(body.iter().all(|r| r["heartRate"].is_number() && r["spo2"].is_number()));

        let capped: Vec<Value> = get(&sim, "/vitals?samples=100000").await.json().await.unwrap();
        assert_eq!(capped.len(), handlers::MAX_SAMPLES);
    }

    #[tokio::test]
    async fn test_shutdown_stops_listening() {
        let mut sim = DeviceSimulator::new(SimulatorSettings::default())
            .spawn_local()
            .await
            .unwrap();
        let addr = sim.address();
        sim.shutdown().await;
        assert!(reqwest::get(format!("http://{}/status", addr)).await.is_err());
    }
}
