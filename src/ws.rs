//! WebSocket transport between the browser terminal and the supervised PTY.
//!
//! Binary frames carry raw terminal bytes in both directions. Text frames
//! carry JSON control envelopes: the client may send
//! `{"type":"resize","cols":N,"rows":N}`, the server sends
//! `{"type":"error","error":{...}}` once before closing on process exit.
//! A ping/pong heartbeat reclaims connections whose peer vanished without a
//! clean close; a disconnect never kills the process itself.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::error::AppError;
use crate::origin;
use crate::session::SessionEvent;
use crate::state::AppState;

pub const PING_INTERVAL: Duration = Duration::from_secs(20);
pub const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Control envelope accepted from the client. Anything else on the text
/// channel is noise and is dropped without closing the connection.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ControlMessage {
    Resize { cols: u16, rows: u16 },
}

/// `GET /sessions/:id/ws` upgrade endpoint.
///
/// Origin and session checks happen before the protocol handshake, so
/// rejected clients get a plain HTTP response, not a WebSocket close frame.
/// The upgrade extractor is optional for the same reason: a bad origin must
/// see 403 even when the request is not a well-formed upgrade.
pub async fn terminal_ws(
    ws: Option<WebSocketUpgrade>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let request_origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if !origin::origin_allowed(request_origin) {
        debug!(origin = ?request_origin, "rejecting upgrade from disallowed origin");
        return StatusCode::FORBIDDEN.into_response();
    }
    if state.sessions.status(&session_id).is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }
    match ws {
        Some(ws) => ws.on_upgrade(move |socket| handle_socket(socket, session_id, state)),
        None => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn handle_socket(socket: WebSocket, session_id: String, state: AppState) {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    // The session can die between the pre-handshake check and here.
    let generation = match state.sessions.attach(&session_id, events_tx) {
        Ok(generation) => generation,
        Err(_) => {
            debug!(session = %session_id, "session vanished before attach");
            return;
        }
    };
    info!(session = %session_id, "transport attached");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut heartbeat = Heartbeat::default();
    let mut ping_timer = interval(PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = events_rx.recv() => match event {
                Some(SessionEvent::Output(bytes)) => {
                    if ws_tx.send(Message::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                Some(SessionEvent::Exited(err)) => {
                    let _ = ws_tx.send(Message::Text(error_frame(&err))).await;
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                Some(SessionEvent::Detached) | None => break,
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Binary(data))) => state.sessions.write(&session_id, &data),
                Some(Ok(Message::Text(text))) => apply_control(&state, &session_id, &text),
                Some(Ok(Message::Pong(_))) => heartbeat.on_pong(),
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
            },
            _ = ping_timer.tick() => {
                if !heartbeat.on_ping_tick(Instant::now()) {
                    info!(session = %session_id, "peer missed heartbeat, terminating transport");
                    break;
                }
                if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            },
            _ = wait_for_deadline(heartbeat.deadline()), if heartbeat.deadline().is_some() => {
                info!(session = %session_id, "pong timeout, terminating transport");
                break;
            },
        }
    }

    state.sessions.detach(&session_id, generation);
    info!(session = %session_id, "transport detached");
}

/// Parse and apply one text-channel control envelope; invalid input is ignored.
fn apply_control(state: &AppState, session_id: &str, text: &str) {
    match serde_json::from_str::<ControlMessage>(text) {
        Ok(ControlMessage::Resize { cols, rows }) => {
            state.sessions.resize(session_id, cols, rows);
        }
        Err(_) => debug!(session = session_id, "ignoring unrecognized control message"),
    }
}

fn error_frame(err: &AppError) -> String {
    serde_json::json!({ "type": "error", "error": err }).to_string()
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Liveness bookkeeping for one transport.
///
/// A peer is dead when a pong misses [`PONG_TIMEOUT`], or when the previous
/// ping is still unanswered by the time the next one would go out.
#[derive(Debug, Default)]
struct Heartbeat {
    awaiting_pong_since: Option<Instant>,
}

impl Heartbeat {
    fn on_pong(&mut self) {
        self.awaiting_pong_since = None;
    }

    /// Returns false when the peer must be considered dead.
    fn on_ping_tick(&mut self, now: Instant) -> bool {
        if self.awaiting_pong_since.is_some() {
            return false;
        }
        self.awaiting_pong_since = Some(now);
        true
    }

    fn deadline(&self) -> Option<Instant> {
        self.awaiting_pong_since.map(|sent| sent + PONG_TIMEOUT)
    }
}
