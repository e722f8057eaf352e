//! WebSocket push transport.
//!
//! Holds one persistent socket to the device. Every text or binary frame is
//! normalized and each resulting reading is delivered on its own. When the
//! socket drops, a retry is scheduled after a fixed interval until the client
//! is closed.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{RetryPolicy, TransportError, TransportKind, VitalsTransport};
use crate::buffer::ReadingStore;
use crate::config::{EndpointConfig, EndpointHandle, PushSettings};
use crate::normalize::{normalize_payload, FieldSet};
use crate::reading::{ConnectionState, Reading};
use crate::subscribe::{Dispatcher, Handlers, Subscription};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How an open socket session ended.
#[derive(Debug)]
enum SocketEnd {
    /// Device closed or the socket failed.
    Dropped(Option<TransportError>),
    /// The endpoint changed; reconnect at once.
    Retarget,
    /// The session was ended by the owner.
    Stale,
}

struct PushInner {
    source: String,
    endpoint: EndpointHandle,
    store: ReadingStore,
    settings: PushSettings,
    dispatcher: Dispatcher,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Client for devices that push frames over a WebSocket.
pub struct PushClient {
    inner: Arc<PushInner>,
}

impl PushClient {
    /// Create an idle client. Nothing connects until [`PushClient::connect`].
    pub fn new(
        source: impl Into<String>,
        endpoint: EndpointHandle,
        store: ReadingStore,
        settings: PushSettings,
    ) -> Self {
        Self {
            inner: Arc::new(PushInner {
                source: source.into(),
                endpoint,
                store,
                settings,
                dispatcher: Dispatcher::new(),
                task: Mutex::new(None),
            }),
        }
    }

    /// Open the socket, retrying until [`PushClient::close`]. No-op if already
    /// running.
    pub fn connect(&self) {
        let inner = &self.inner;
        inner.dispatcher.exclusive(|| {
            if self.is_running() {
                return;
            }
            let session = inner.dispatcher.begin_session();
            let handle = tokio::spawn(run_socket_loop(inner.clone(), session));
            *inner.task.lock() = Some(handle);
        });
    }

    /// Close the socket and cancel any pending retry.
    ///
    /// Fires `on_disconnect` if the device was connected; no callback fires
    /// after this returns.
    pub fn close(&self) {
        let inner = &self.inner;
        inner.dispatcher.exclusive(|| {
            inner
                .dispatcher
                .with_current(|e| e.transition(ConnectionState::Disconnected));
            inner.dispatcher.end_session();
            if let Some(task) = inner.task.lock().take() {
                task.abort();
                tracing::info!("Closed WebSocket client for {}", inner.source);
            }
        });
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// The `ws://` or `wss://` URL the next connection attempt will use.
    pub fn url(&self) -> String {
        self.inner.endpoint.current().ws_url()
    }
}

impl Drop for PushClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl VitalsTransport for PushClient {
    fn kind(&self) -> TransportKind {
        TransportKind::Push
    }

    fn source(&self) -> &str {
        &self.inner.source
    }

    fn set_handlers(&self, handlers: Handlers) -> Subscription {
        self.inner.dispatcher.set_handlers(handlers)
    }

    fn connect(&self) {
        PushClient::connect(self);
    }

    fn disconnect(&self) {
        self.close();
    }

    fn reconnect(&self) {
        let inner = &self.inner;
        inner.dispatcher.exclusive(|| {
            inner
                .dispatcher
                .with_current(|e| e.transition(ConnectionState::Disconnected));
            self.close();
            PushClient::connect(self);
        });
    }

    fn is_running(&self) -> bool {
        PushClient::is_running(self)
    }

    fn state(&self) -> ConnectionState {
        self.inner.dispatcher.state()
    }

    fn last_readings(&self) -> Vec<Reading> {
        self.inner.store.snapshot(&self.inner.source)
    }
}

impl PushInner {
    /// Deliver one frame. Returns false once the session has ended.
    fn handle_frame(&self, session: u64, text: &str) -> bool {
        let normalized = normalize_payload(text, FieldSet::Push);

        self.dispatcher
            .with_session(session, |emitter| {
                if normalized.rejected > 0 {
                    tracing::warn!(
                        "Dropped {} malformed record(s) in frame from {}",
                        normalized.rejected,
                        self.source
                    );
                    emitter.error(&TransportError::Decode(format!(
                        "{} record(s) missing ecg/ppg or not numeric",
                        normalized.rejected
                    )));
                }

                for reading in &normalized.readings {
                    if !emitter.is_live() {
                        break;
                    }
                    let one = std::slice::from_ref(reading);
                    self.store.append(&self.source, one);
                    emitter.data(one);
                }

                emitter.is_live()
            })
            .unwrap_or(false)
    }

    async fn run_session(
        &self,
        session: u64,
        socket: Socket,
        endpoint_rx: &mut watch::Receiver<EndpointConfig>,
    ) -> SocketEnd {
        let (mut sink, mut stream) = socket.split();

        let live = self
            .dispatcher
            .with_session(session, |e| {
                if e.transition(ConnectionState::Connected) {
                    tracing::info!("Connected to device via WebSocket ({})", self.source);
                }
                e.is_live()
            })
            .unwrap_or(false);
        if !live {
            let _ = sink.close().await;
            return SocketEnd::Stale;
        }

        let greeting = json!({"type": "init", "client": self.settings.client_name}).to_string();
        if let Err(e) = sink.send(Message::Text(greeting.into())).await {
            tracing::warn!("Failed to send greeting to device: {}", e);
        }

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !self.handle_frame(session, text.as_str()) {
                            return SocketEnd::Stale;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        if !self.handle_frame(session, &String::from_utf8_lossy(&bytes)) {
                            return SocketEnd::Stale;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.as_str().to_string())
                            .unwrap_or_default();
                        tracing::info!("Device closed WebSocket ({}): {}", self.source, reason);
                        return SocketEnd::Dropped(None);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SocketEnd::Dropped(Some(e.into())),
                    None => {
                        return SocketEnd::Dropped(Some(TransportError::Closed(
                            "stream ended".to_string(),
                        )))
                    }
                },
                Ok(()) = endpoint_rx.changed() => {
                    let _ = sink.close().await;
                    return SocketEnd::Retarget;
                }
            }
        }
    }

    /// Report a failed attempt or dropped socket. Returns false once the
    /// session has ended.
    fn on_dropped(&self, session: u64, err: Option<TransportError>) -> bool {
        self.dispatcher
            .with_session(session, |emitter| {
                if let Some(err) = &err {
                    tracing::warn!("WebSocket error for {}: {}", self.source, err);
                    emitter.error(err);
                }
                if emitter.transition(ConnectionState::Disconnected) {
                    tracing::info!(
                        "Disconnected from device ({}), retrying in {:?}",
                        self.source,
                        self.settings.reconnect_interval
                    );
                }
                emitter.is_live()
            })
            .unwrap_or(false)
    }
}

/// Connect, read until the socket drops, wait, repeat.
async fn run_socket_loop(inner: Arc<PushInner>, session: u64) {
    let mut endpoint_rx = inner.endpoint.subscribe();
    let policy = RetryPolicy::fixed(inner.settings.reconnect_interval);
    let connect_timeout = inner.settings.connect_timeout;

    loop {
        let url = endpoint_rx.borrow_and_update().ws_url();

        let live = inner
            .dispatcher
            .with_session(session, |e| {
                e.transition(ConnectionState::Connecting);
                e.is_live()
            })
            .unwrap_or(false);
        if !live {
            break;
        }
        tracing::debug!("Connecting to {}", url);

        let attempt = tokio::select! {
            result = tokio::time::timeout(connect_timeout, connect_async(url.as_str())) => {
                Some(result)
            }
            Ok(()) = endpoint_rx.changed() => None,
        };

        let end = match attempt {
            None => SocketEnd::Retarget,
            Some(Err(_)) => SocketEnd::Dropped(Some(TransportError::Timeout(connect_timeout))),
            Some(Ok(Err(e))) => SocketEnd::Dropped(Some(e.into())),
            Some(Ok(Ok((socket, _response)))) => {
                inner.run_session(session, socket, &mut endpoint_rx).await
            }
        };

        match end {
            SocketEnd::Stale => break,
            SocketEnd::Retarget => {
                if !inner.on_dropped(session, None) {
                    break;
                }
                tracing::info!(
                    "Device address changed, reconnecting to {}",
                    inner.endpoint.current().ws_url()
                );
                continue;
            }
            SocketEnd::Dropped(err) => {
                if !inner.on_dropped(session, err) {
                    break;
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(policy.delay_for(0)) => {}
            Ok(()) = endpoint_rx.changed() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{DeviceSimulator, SimulatorHandle, SimulatorSettings};
    use crate::testing::{recording_handlers, wait_for, wait_until, Event};
    use std::time::Duration;

    fn fast_settings() -> PushSettings {
        PushSettings {
            reconnect_interval: Duration::from_millis(50),
            connect_timeout: Duration::from_millis(500),
            client_name: "vitals-feed-test".to_string(),
        }
    }

    async fn quiet_sim() -> SimulatorHandle {
        quiet_sim_at("127.0.0.1:0".parse().unwrap()).await
    }

    async fn quiet_sim_at(addr: std::net::SocketAddr) -> SimulatorHandle {
        DeviceSimulator::new(SimulatorSettings {
            stream_synthetic: false,
            ..Default::default()
        })
        .spawn(addr)
        .await
        .unwrap()
    }

    fn client_for(address: &str) -> PushClient {
        let endpoint = EndpointHandle::parse(&format!("ws://{}", address)).unwrap();
        PushClient::new("pat_001", endpoint, ReadingStore::default(), fast_settings())
    }

    async fn next_data(events: &mut tokio::sync::mpsc::UnboundedReceiver<Event>) -> Vec<Reading> {
        loop {
            match wait_for(events, Duration::from_secs(5)).await {
                Some(Event::Data(batch)) => return batch,
                Some(_) => {}
                None => panic!("no data"),
            }
        }
    }

    #[tokio::test]
    async fn test_connect_greets_and_delivers_each_reading() {
        let sim = quiet_sim().await;
        let client = client_for(&sim.address());
        let (handlers, mut events) = recording_handlers();
        client.set_handlers(handlers);
        client.connect();

        assert!(matches!(
            wait_for(&mut events, Duration::from_secs(5)).await,
            Some(Event::Connect)
        ));
        assert!(wait_until(|| sim.ws_clients() == 1, Duration::from_secs(5)).await);
        assert!(wait_until(|| !sim.received().is_empty(), Duration::from_secs(5)).await);
        let greeting: serde_json::Value = serde_json::from_str(&sim.received()[0]).unwrap();
        assert_eq!(greeting["type"], "init");
        assert_eq!(greeting["client"], "vitals-feed-test");

        sim.push_frame(r#"{"timestamp": 1723998155000, "ecg": 0.42, "ppg": 512}"#);
        let batch = next_data(&mut events).await;
        assert_eq!(batch, vec![Reading::ecg_ppg(1_723_998_155_000, 0.42, 512.0)]);

        sim.push_frame(
            r#"[
                {"ts": 1, "ecg": 0.1, "ppg": 1},
                {"ts": 2, "ecg": 0.2, "ppg": 2},
                {"ts": 3, "ecg": 0.3, "ppg": 3}
            ]"#,
        );
        for _ in 0..3 {
            assert_eq!(next_data(&mut events).await.len(), 1);
        }
        assert_eq!(client.last_readings().len(), 4);
        assert!(client.is_device_connected());
        client.close();
    }

    #[tokio::test]
    async fn test_malformed_frames_report_errors() {
        let sim = quiet_sim().await;
        let client = client_for(&sim.address());
        let (handlers, mut events) = recording_handlers();
        client.set_handlers(handlers);
        client.connect();
        assert!(wait_until(|| sim.ws_clients() == 1, Duration::from_secs(5)).await);

        sim.push_frame(r#"{"ts": 1, "ecg": 0.1}"#);
        sim.push_frame("definitely not a reading");

        let mut errors = 0;
        while errors < 2 {
            match wait_for(&mut events, Duration::from_secs(5)).await {
                Some(Event::Error(TransportError::Decode(_))) => errors += 1,
                Some(Event::Data(_)) => panic!("malformed frame produced data"),
                Some(_) => {}
                None => panic!("missing decode errors"),
            }
        }
        assert!(client.last_readings().is_empty());
        client.close();
    }

    #[tokio::test]
    async fn test_binary_frames_are_decoded() {
        let sim = quiet_sim().await;
        let client = client_for(&sim.address());
        let (handlers, mut events) = recording_handlers();
        client.set_handlers(handlers);
        client.connect();
        assert!(wait_until(|| sim.ws_clients() == 1, Duration::from_secs(5)).await);

        sim.push_binary(b"1723998155\t0.5\t300".to_vec());
        let batch = next_data(&mut events).await;
        assert_eq!(batch[0].timestamp, 1_723_998_155_000);
        assert_eq!(batch[0].ppg, Some(300.0));
        client.close();
    }

    #[tokio::test]
    async fn test_drop_schedules_reconnect() {
        let sim = quiet_sim().await;
        let client = client_for(&sim.address());
        let (handlers, mut events) = recording_handlers();
        client.set_handlers(handlers);
        client.connect();
        assert!(wait_until(|| sim.ws_clients() == 1, Duration::from_secs(5)).await);

        sim.kick_clients();

        let mut log = Vec::new();
        while log.iter().filter(|e| matches!(e, Event::Connect)).count() < 2 {
            match wait_for(&mut events, Duration::from_secs(5)).await {
                Some(e) => log.push(e),
                None => panic!("did not reconnect: {:?}", log),
            }
        }
        let disconnects = log.iter().filter(|e| matches!(e, Event::Disconnect)).count();
        assert_eq!(disconnects, 1);
        assert!(client.is_running());
        client.close();
    }

    #[tokio::test]
    async fn test_close_fires_single_disconnect() {
        let sim = quiet_sim().await;
        let client = client_for(&sim.address());
        let (handlers, mut events) = recording_handlers();
        client.set_handlers(handlers);
        client.connect();
        assert!(matches!(
            wait_for(&mut events, Duration::from_secs(5)).await,
            Some(Event::Connect)
        ));
        assert!(wait_until(|| sim.ws_clients() == 1, Duration::from_secs(5)).await);

        client.close();
        client.close();
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        assert_eq!(drained.len(), 1, "{:?}", drained);
        assert!(matches!(drained[0], Event::Disconnect));

        sim.push_frame(r#"{"ts": 1, "ecg": 0.1, "ppg": 1}"#);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(events.try_recv().is_err());
        assert!(!client.is_running());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(wait_until(|| sim.ws_clients() == 0, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_close_from_callback_stops_remaining_readings() {
        let sim = quiet_sim().await;
        let client = Arc::new(client_for(&sim.address()));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let weak = Arc::downgrade(&client);
        client.set_handlers(Handlers::new().on_data(move |batch| {
            let _ = tx.send(batch.to_vec());
            if let Some(client) = weak.upgrade() {
                client.close();
            }
        }));
        client.connect();
        assert!(wait_until(|| sim.ws_clients() == 1, Duration::from_secs(5)).await);

        sim.push_frame(r#"[{"ts": 1, "ecg": 0.1, "ppg": 1}, {"ts": 2, "ecg": 0.2, "ppg": 2}]"#);
        assert!(tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(client.last_readings().len(), 1);
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn test_unreachable_device_keeps_retrying() {
        let client = client_for("127.0.0.1:1");
        let (handlers, mut events) = recording_handlers();
        client.set_handlers(handlers);
        client.connect();

        let mut errors = 0;
        while errors < 2 {
            match wait_for(&mut events, Duration::from_secs(5)).await {
                Some(Event::Error(_)) => errors += 1,
                Some(other) => panic!("unexpected {:?}", other),
                None => panic!("no retry"),
            }
        }
        assert!(client.is_running());
        assert!(!client.is_device_connected());
        client.close();
    }

    #[tokio::test]
    async fn test_close_cancels_pending_reconnect() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let client = client_for(&addr.to_string());
        let (handlers, mut events) = recording_handlers();
        client.set_handlers(handlers);
        client.connect();

        // First attempt fails; a retry is now scheduled.
        assert!(matches!(
            wait_for(&mut events, Duration::from_secs(5)).await,
            Some(Event::Error(_))
        ));
        client.close();
        while events.try_recv().is_ok() {}

        // The device comes up where the retry would have gone.
        let sim = quiet_sim_at(addr).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(events.try_recv().is_err());
        assert_eq!(sim.ws_clients(), 0);
        assert!(!client.is_running());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_endpoint_change_moves_socket() {
        let first = quiet_sim().await;
        let second = quiet_sim().await;
        let endpoint = EndpointHandle::parse(&format!("ws://{}", first.address())).unwrap();
        let client =
            PushClient::new("dev", endpoint.clone(), ReadingStore::default(), fast_settings());
        client.connect();
        assert!(wait_until(|| first.ws_clients() == 1, Duration::from_secs(5)).await);

        endpoint.set_address(&format!("ws://{}", second.address())).unwrap();
        assert!(wait_until(|| second.ws_clients() == 1, Duration::from_secs(5)).await);
        assert!(wait_until(|| first.ws_clients() == 0, Duration::from_secs(5)).await);
        assert_eq!(client.url(), format!("ws://{}", second.address()));
        client.close();
    }

    #[tokio::test]
    async fn test_reconnect_fires_disconnect_then_connect() {
        let sim = quiet_sim().await;
        let client = client_for(&sim.address());
        let (handlers, mut events) = recording_handlers();
        client.set_handlers(handlers);
        client.connect();
        assert!(matches!(
            wait_for(&mut events, Duration::from_secs(5)).await,
            Some(Event::Connect)
        ));

        VitalsTransport::reconnect(&client);
        assert!(matches!(events.try_recv(), Ok(Event::Disconnect)));
        assert!(matches!(
            wait_for(&mut events, Duration::from_secs(5)).await,
            Some(Event::Connect)
        ));
        client.close();
    }
}
