//! SSE per-session stream and the monitor WebSocket fan-out (SPEC_FULL.md §4.7/§6).
//!
//! Grounded on the teacher's `src-tauri/src/core/sse_proxy.rs` SSE pattern
//! (`axum::response::sse::{Event, Sse}` over a channel-backed stream) and on
//! `ws_proxy.rs`'s write-with-deadline convention for the monitor socket.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures::stream::Stream;
use tokio::sync::mpsc;

use wiretap_core::monitor::{MonitorEvent, MonitorEventType, SharedMonitorHub, BROADCAST_WRITE_TIMEOUT};

use crate::state::AppState;

fn sse_event_name(kind: MonitorEventType) -> &'static str {
    match kind {
        MonitorEventType::FrameAdded => "frames",
        MonitorEventType::EventAdded => "events",
        MonitorEventType::HttpTxAdded => "http",
        MonitorEventType::SessionStarted => "session_started",
        MonitorEventType::SessionEnded | MonitorEventType::SessionError => "session_ended",
        _ => "message",
    }
}

struct SessionStreamState {
    rx: mpsc::Receiver<MonitorEvent>,
    monitor: SharedMonitorHub,
    listener_id: u64,
    session_id: String,
    done: bool,
}

/// `GET /api/sessions_stream/{id}` — subscribes to the monitor hub and
/// forwards only events whose `id` matches this session, translated into
/// the SSE event names SPEC_FULL.md §6 lists (`frames`, `events`, `http`,
/// `session_started`, `session_ended`). Held open until the client
/// disconnects, per §5's "SSE holds open until the client disconnects".
pub async fn session_stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let (listener_id, rx) = state.monitor.subscribe().await;
    let poll_interval = Duration::from_millis(state.config.sse_poll_interval_ms.max(1) as u64);

    let init = SessionStreamState {
        rx,
        monitor: state.monitor.clone(),
        listener_id,
        session_id,
        done: false,
    };

    let stream = futures::stream::unfold(init, |mut s| async move {
        if s.done {
            return None;
        }
        loop {
            match s.rx.recv().await {
                Some(ev) if ev.id == s.session_id => {
                    let name = sse_event_name(ev.kind);
                    let data = serde_json::to_string(&ev).unwrap_or_default();
                    let out = Ok(SseEvent::default().event(name).data(data));
                    return Some((out, s));
                }
                Some(_) => continue,
                None => {
                    s.monitor.unsubscribe(s.listener_id).await;
                    s.done = true;
                    let out = Ok(SseEvent::default().event("session_ended").data(""));
                    return Some((out, s));
                }
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(poll_interval).text("keep-alive"))
}

/// `GET /api/monitor/ws` — registers a WS monitor client and drains its
/// channel into the socket, applying the shared `BROADCAST_WRITE_TIMEOUT`
/// deadline per write (SPEC_FULL.md §5: "2 s for monitor socket writes").
pub async fn monitor_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_monitor_socket(state, socket))
}

async fn run_monitor_socket(state: AppState, mut socket: WebSocket) {
    let (client_id, mut rx) = state.monitor.register_client(128).await;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            event = rx.recv() => {
                let Some(event) = event else { break };
                let Ok(payload) = serde_json::to_string(&event) else { continue };
                match tokio::time::timeout(BROADCAST_WRITE_TIMEOUT, socket.send(Message::Text(payload))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
        }
    }

    state.monitor.unregister_client(client_id).await;
}
