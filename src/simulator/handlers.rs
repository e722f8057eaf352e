//! Simulator request handlers.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;

use super::{Fallback, Outbound, Scripted, SimState};
use crate::normalize::now_millis;

pub const DEFAULT_SAMPLES: usize = 20;
pub const MAX_SAMPLES: usize = 1000;

// ============================================================================
// HTTP
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct VitalsQuery {
    pub samples: Option<usize>,
}

pub async fn handle_vitals(
    State(state): State<Arc<SimState>>,
    uri: Uri,
    Query(query): Query<VitalsQuery>,
) -> Response {
    state.record(uri.to_string());
    state.vitals_requests.fetch_add(1, Ordering::SeqCst);

    let scripted = state.script.lock().pop_front();
    if let Some(scripted) = scripted {
        return match scripted {
            Scripted::Json(value) => Json(value).into_response(),
            Scripted::Text(text) => {
                (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")], text).into_response()
            }
            Scripted::Status(code) => status_response(code),
            Scripted::Stall(delay) => {
                tokio::time::sleep(delay).await;
                Json(json!([])).into_response()
            }
        };
    }

    let fallback = state.fallback.lock().clone();
    match fallback {
        Fallback::Synthetic => {
            let samples = query.samples.unwrap_or(DEFAULT_SAMPLES).clamp(1, MAX_SAMPLES);
            let readings = state.waveform.lock().take(samples, now_millis());
            Json(readings).into_response()
        }
        Fallback::Empty => Json(json!([])).into_response(),
        Fallback::Status(code) => status_response(code),
        Fallback::Json(value) => Json(value).into_response(),
    }
}

fn status_response(code: u16) -> Response {
    StatusCode::from_u16(code)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        .into_response()
}

pub async fn handle_status(State(state): State<Arc<SimState>>, uri: Uri) -> impl IntoResponse {
    state.record(uri.to_string());
    let rssi = -50 - (rand::random::<u8>() % 15) as i64;
    Json(json!({
        "uptime": state.started.elapsed().as_secs(),
        "signalStrength": rssi,
        "bufferSize": state.script.lock().len(),
        "wsClients": state.ws_clients.load(Ordering::SeqCst),
        "sampleRateHz": state.settings.sample_rate_hz,
    }))
}

pub async fn handle_info(State(state): State<Arc<SimState>>, uri: Uri) -> impl IntoResponse {
    state.record(uri.to_string());
    Json(json!({
        "name": "vitals-sim",
        "firmware": env!("CARGO_PKG_VERSION"),
        "sampleRateHz": state.settings.sample_rate_hz,
        "heartRateBpm": state.settings.heart_rate_bpm,
        "endpoints": ["/vitals", "/status", "/info", "/ws"],
    }))
}

// ============================================================================
// WebSocket
// ============================================================================

pub async fn handle_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SimState>>,
    uri: Uri,
) -> impl IntoResponse {
    state.record(uri.to_string());
    ws.on_upgrade(move |socket| serve_client(socket, state))
}

async fn serve_client(mut socket: WebSocket, state: Arc<SimState>) {
    let mut outbound = state.outbound.subscribe();
    let clients = state.ws_clients.fetch_add(1, Ordering::SeqCst) + 1;
    tracing::info!("WebSocket client connected ({} total)", clients);

    loop {
        tokio::select! {
            msg = outbound.recv() => {
                let frame = match msg {
                    Ok(Outbound::Text(text)) => Message::Text(text.into()),
                    Ok(Outbound::Binary(bytes)) => Message::Binary(bytes.into()),
                    Ok(Outbound::Close) => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("WebSocket client lagged, skipped {} frames", n);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if socket.send(frame).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("WebSocket client says: {}", text.as_str());
                    state.received.lock().push(text.as_str().to_string());
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let clients = state.ws_clients.fetch_sub(1, Ordering::SeqCst) - 1;
    tracing::info!("WebSocket client disconnected ({} left)", clients);
}
