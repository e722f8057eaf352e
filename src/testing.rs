//! Shared helpers for transport tests.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::reading::Reading;
use crate::subscribe::Handlers;
use crate::transport::TransportError;

#[derive(Debug, Clone)]
pub enum Event {
    Connect,
    Disconnect,
    Data(Vec<Reading>),
    Error(TransportError),
}

/// Handlers that forward every callback into a channel, in order.
pub fn recording_handlers() -> (Handlers, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (connect, disconnect, data, error) = (tx.clone(), tx.clone(), tx.clone(), tx);
    let handlers = Handlers::new()
        .on_connect(move || {
            let _ = connect.send(Event::Connect);
        })
        .on_disconnect(move || {
            let _ = disconnect.send(Event::Disconnect);
        })
        .on_data(move |batch| {
            let _ = data.send(Event::Data(batch.to_vec()));
        })
        .on_error(move |e| {
            let _ = error.send(Event::Error(e.clone()));
        });
    (handlers, rx)
}

pub async fn wait_for(rx: &mut mpsc::UnboundedReceiver<Event>, timeout: Duration) -> Option<Event> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn wait_until(cond: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
