//! WebSocket reverse-proxy engine (SPEC_FULL.md §4.2).
//!
//! Dials the upstream target, accepts the client's upgrade, then runs two
//! independent pump tasks — one per direction — each owning its half of the
//! socket outright so pump writes and live-injected writes never interleave
//! without needing a separate write-serialization lock (the socket's sink is
//! never touched from more than one task).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as TungsteniteCloseFrame;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

use wiretap_core::domain::{Direction, Opcode, Session, SessionKind};
use wiretap_core::live::InjectedText;
use wiretap_core::monitor::{MonitorEvent, MonitorEventType};
use wiretap_core::preview::{format_binary_preview, format_text_preview};
use wiretap_core::store::{new_frame, new_session};
use wiretap_core::{socketio, CoreError};

use crate::state::AppState;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(15);

const FORWARD_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "origin",
    "user-agent",
    "referer",
    "sec-websocket-protocol",
];

type UpstreamSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub fn error_response(err: CoreError) -> Response {
    let status = axum::http::StatusCode::from_u16(err.status()).unwrap_or(axum::http::StatusCode::BAD_REQUEST);
    (status, axum::Json(err.to_envelope(None))).into_response()
}

/// Reads `target`, falling back to `_target`, then the configured default.
pub fn resolve_target(params: &HashMap<String, String>, default_target: &Option<String>) -> Result<String, CoreError> {
    params
        .get("target")
        .or_else(|| params.get("_target"))
        .cloned()
        .or_else(|| default_target.clone())
        .ok_or(CoreError::MissingTarget)
}

/// `http`→`ws`, `https`→`wss`, `ws`/`wss` pass through verbatim (including
/// query string), anything else is `INVALID_TARGET`.
pub fn normalize_ws_target(target: &str) -> Result<String, CoreError> {
    if let Some(rest) = target.strip_prefix("http://") {
        Ok(format!("ws://{rest}"))
    } else if let Some(rest) = target.strip_prefix("https://") {
        Ok(format!("wss://{rest}"))
    } else if target.starts_with("ws://") || target.starts_with("wss://") {
        Ok(target.to_string())
    } else {
        Err(CoreError::InvalidTarget(target.to_string()))
    }
}

fn forward_request_headers(client_headers: &HeaderMap, target: &str, out: &mut HeaderMap) {
    for name in FORWARD_HEADERS {
        if let Some(v) = client_headers.get(*name) {
            out.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                v.clone(),
            );
        }
    }
    if !out.contains_key(axum::http::header::ORIGIN) {
        if let Ok(url) = reqwest::Url::parse(target) {
            let scheme = if url.scheme() == "wss" { "https" } else { "http" };
            if let Some(host) = url.host_str() {
                let origin = match url.port() {
                    Some(p) => format!("{scheme}://{host}:{p}"),
                    None => format!("{scheme}://{host}"),
                };
                if let Ok(v) = axum::http::HeaderValue::from_str(&origin) {
                    out.insert(axum::http::header::ORIGIN, v);
                }
            }
        }
    }
}

pub async fn handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let target = match resolve_target(&params, &state.config.default_target) {
        Ok(t) => t,
        Err(e) => return error_response(e),
    };
    let ws_target = match normalize_ws_target(&target) {
        Ok(t) => t,
        Err(e) => return error_response(e),
    };

    let mut req = match ws_target.as_str().into_client_request() {
        Ok(r) => r,
        Err(_) => return error_response(CoreError::InvalidTarget(ws_target.clone())),
    };
    forward_request_headers(&headers, &ws_target, req.headers_mut());

    let session = state
        .store
        .create_session(new_session(ws_target.clone(), addr.to_string(), SessionKind::Ws))
        .await;
    state
        .monitor
        .broadcast(MonitorEvent::new(MonitorEventType::SessionStarted, session.id.clone()))
        .await;
    state.metrics.active_sessions.inc();

    let dial = tokio::time::timeout(DIAL_TIMEOUT, tokio_tungstenite::connect_async(req)).await;

    let (upstream, subprotocol, dial_err) = match dial {
        Ok(Ok((stream, resp))) => {
            let proto = resp
                .headers()
                .get(axum::http::header::SEC_WEBSOCKET_PROTOCOL)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            (Some(stream), proto, None)
        }
        Ok(Err(e)) => (None, None, Some(e.to_string())),
        Err(_) => (None, None, Some("dial timeout after 10s".to_string())),
    };

    if let Some(err) = &dial_err {
        state.store.set_closed(&session.id, Some(err.clone())).await;
        state
            .monitor
            .broadcast(
                MonitorEvent::new(MonitorEventType::SessionError, session.id.clone())
                    .with_error(err.clone()),
            )
            .await;
        state.metrics.active_sessions.dec();
    }

    let mut ws = ws;
    if let Some(proto) = subprotocol.clone() {
        ws = ws.protocols([proto]);
    }

    let reason = dial_err.map(|e| humanize_dial_error(&e));
    ws.on_upgrade(move |socket| async move {
        match upstream {
            Some(upstream_ws) => run_pump(state, session, socket, upstream_ws).await,
            None => {
                let mut socket = socket;
                let _ = socket
                    .send(AxumMessage::Close(Some(CloseFrame {
                        code: 1013,
                        reason: reason.unwrap_or_else(|| "Try Again Later".to_string()).into(),
                    })))
                    .await;
            }
        }
    })
}

fn humanize_dial_error(e: &str) -> String {
    format!("upstream unavailable: {e}")
}

fn axum_to_tungstenite(msg: AxumMessage) -> Option<TungsteniteMessage> {
    match msg {
        AxumMessage::Text(t) => Some(TungsteniteMessage::Text(t)),
        AxumMessage::Binary(b) => Some(TungsteniteMessage::Binary(b)),
        AxumMessage::Ping(b) => Some(TungsteniteMessage::Ping(b)),
        AxumMessage::Pong(b) => Some(TungsteniteMessage::Pong(b)),
        AxumMessage::Close(frame) => Some(TungsteniteMessage::Close(frame.map(|f| TungsteniteCloseFrame {
            code: f.code.into(),
            reason: f.reason.to_string().into(),
        }))),
    }
}

fn tungstenite_to_axum(msg: TungsteniteMessage) -> Option<AxumMessage> {
    match msg {
        TungsteniteMessage::Text(t) => Some(AxumMessage::Text(t)),
        TungsteniteMessage::Binary(b) => Some(AxumMessage::Binary(b)),
        TungsteniteMessage::Ping(b) => Some(AxumMessage::Ping(b)),
        TungsteniteMessage::Pong(b) => Some(AxumMessage::Pong(b)),
        TungsteniteMessage::Close(frame) => Some(AxumMessage::Close(frame.map(|f| CloseFrame {
            code: f.code.into(),
            reason: f.reason.to_string().into(),
        }))),
        TungsteniteMessage::Frame(_) => None,
    }
}

fn opcode_and_bytes_axum(msg: &AxumMessage) -> (Opcode, Vec<u8>) {
    match msg {
        AxumMessage::Text(t) => (Opcode::Text, t.as_bytes().to_vec()),
        AxumMessage::Binary(b) => (Opcode::Binary, b.clone()),
        AxumMessage::Ping(b) => (Opcode::Ping, b.clone()),
        AxumMessage::Pong(b) => (Opcode::Pong, b.clone()),
        AxumMessage::Close(_) => (Opcode::Close, Vec::new()),
    }
}

fn preview_for(cfg: &wiretap_core::Config, opcode: Opcode, bytes: &[u8]) -> String {
    match opcode {
        Opcode::Text => format_text_preview(bytes, cfg.preview_max_bytes),
        Opcode::Binary => format_binary_preview(bytes, cfg.preview_max_bytes),
        Opcode::Ping | Opcode::Pong | Opcode::Close => {
            let cap = if cfg.preview_max_bytes > 0 {
                std::cmp::min(cfg.preview_max_bytes as usize, bytes.len())
            } else {
                bytes.len()
            };
            String::from_utf8_lossy(&bytes[..cap]).to_string()
        }
    }
}

/// Shared one-shot termination: whichever direction fails first records the
/// error and wakes the other task so it can unwind too.
struct Closer {
    done: AtomicBool,
    notify: Notify,
}

impl Closer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            done: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    async fn finish(&self, state: &AppState, session_id: &str, error: Option<String>) {
        if self.done.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            state.store.set_closed(session_id, error.clone()).await;
            state.live.unregister(session_id).await;
            let kind = if error.is_some() {
                MonitorEventType::SessionError
            } else {
                MonitorEventType::SessionEnded
            };
            let mut event = MonitorEvent::new(kind, session_id.to_string());
            if let Some(e) = error {
                event = event.with_error(e);
            }
            state.monitor.broadcast(event).await;
            state.metrics.active_sessions.dec();
            self.notify.notify_waiters();
        }
    }
}

async fn record_and_decode(
    state: &AppState,
    session_id: &str,
    direction: Direction,
    opcode: Opcode,
    bytes: &[u8],
    sio_probe_done: &AtomicBool,
) {
    let preview = preview_for(&state.config, opcode, bytes);
    let frame = new_frame(direction, opcode, bytes, preview);
    let frame_id = frame.id.clone();
    state.store.append_frame(session_id, frame).await;
    state.metrics.frames_total.with_label_values(&[direction_label(direction)]).inc();
    state
        .monitor
        .broadcast(MonitorEvent::new(MonitorEventType::FrameAdded, session_id.to_string()).with_ref(frame_id.clone()))
        .await;

    if opcode == Opcode::Text {
        let text = String::from_utf8_lossy(bytes);
        if direction == Direction::UpstreamToClient
            && sio_probe_done.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
        {
            let prefix: String = text.chars().take(6).collect();
            let probe = wiretap_core::domain::Event::new(
                String::new(),
                "sio_probe".to_string(),
                None,
                serde_json::json!({"dir": "upstream->client", "prefix": prefix, "len": bytes.len()}).to_string(),
                vec![frame_id.clone()],
            );
            state.store.append_event(session_id, probe, false).await;
            state
                .monitor
                .broadcast(MonitorEvent::new(MonitorEventType::SioProbe, session_id.to_string()))
                .await;
        }

        if let Some(decoded) = socketio::parse_event(&text) {
            let ack_id = socketio::extract_ack_id(&text);
            let event = wiretap_core::domain::Event::new(
                decoded.namespace,
                decoded.name,
                ack_id,
                decoded.args_json,
                vec![frame_id],
            );
            state.store.append_event(session_id, event, true).await;
            state.metrics.sio_events_total.inc();
            state
                .monitor
                .broadcast(MonitorEvent::new(MonitorEventType::EventAdded, session_id.to_string()))
                .await;
        }
    }
}

fn direction_label(direction: Direction) -> &'static str {
    match direction {
        Direction::ClientToUpstream => "client_to_upstream",
        Direction::UpstreamToClient => "upstream_to_client",
    }
}

async fn run_pump(state: AppState, session: Session, client: WebSocket, upstream: UpstreamSocket) {
    let session_id = session.id.clone();
    info!(session_id = %session_id, target = %session.target, "ws session started");

    let (mut client_sink, mut client_stream) = client.split();
    let (mut upstream_sink, mut upstream_stream) = upstream.split();

    let (client_inject_tx, mut client_inject_rx) = mpsc::channel::<InjectedText>(16);
    let (upstream_inject_tx, mut upstream_inject_rx) = mpsc::channel::<InjectedText>(16);
    state.live.register(session_id.clone(), client_inject_tx, upstream_inject_tx).await;

    let closer = Closer::new();
    let sio_probe_done = Arc::new(AtomicBool::new(false));

    let state_a = state.clone();
    let sid_a = session_id.clone();
    let closer_a = closer.clone();
    let probe_a = sio_probe_done.clone();
    let client_to_upstream = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = closer_a.notify.notified() => break,
                injected = upstream_inject_rx.recv() => {
                    let Some(injected) = injected else { continue };
                    let write = tokio::time::timeout(WRITE_TIMEOUT, upstream_sink.send(TungsteniteMessage::Text(injected.payload))).await;
                    if matches!(write, Err(_) | Ok(Err(_))) {
                        closer_a.finish(&state_a, &sid_a, Some("injected write failed".into())).await;
                        break;
                    }
                }
                msg = client_stream.next() => {
                    match msg {
                        Some(Ok(msg)) => {
                            let (opcode, bytes) = opcode_and_bytes_axum(&msg);
                            let is_close = matches!(msg, AxumMessage::Close(_));
                            let Some(out) = axum_to_tungstenite(msg) else { continue };
                            let write = tokio::time::timeout(WRITE_TIMEOUT, upstream_sink.send(out)).await;
                            if matches!(write, Err(_) | Ok(Err(_))) {
                                closer_a.finish(&state_a, &sid_a, Some("write to upstream failed".into())).await;
                                break;
                            }
                            record_and_decode(&state_a, &sid_a, Direction::ClientToUpstream, opcode, &bytes, &probe_a).await;
                            if is_close {
                                closer_a.finish(&state_a, &sid_a, None).await;
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            closer_a.finish(&state_a, &sid_a, Some(e.to_string())).await;
                            break;
                        }
                        None => {
                            closer_a.finish(&state_a, &sid_a, None).await;
                            break;
                        }
                    }
                }
            }
        }
        let _ = upstream_sink.close().await;
    });

    let state_b = state.clone();
    let sid_b = session_id.clone();
    let closer_b = closer.clone();
    let probe_b = sio_probe_done.clone();
    let upstream_to_client = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = closer_b.notify.notified() => break,
                injected = client_inject_rx.recv() => {
                    let Some(injected) = injected else { continue };
                    let write = tokio::time::timeout(WRITE_TIMEOUT, client_sink.send(AxumMessage::Text(injected.payload))).await;
                    if matches!(write, Err(_) | Ok(Err(_))) {
                        closer_b.finish(&state_b, &sid_b, Some("injected write failed".into())).await;
                        break;
                    }
                }
                msg = upstream_stream.next() => {
                    match msg {
                        Some(Ok(msg)) => {
                            let is_close = matches!(msg, TungsteniteMessage::Close(_));
                            let Some(axum_msg) = tungstenite_to_axum(msg) else { continue };
                            let (opcode, bytes) = opcode_and_bytes_axum(&axum_msg);
                            let write = tokio::time::timeout(WRITE_TIMEOUT, client_sink.send(axum_msg)).await;
                            if matches!(write, Err(_) | Ok(Err(_))) {
                                closer_b.finish(&state_b, &sid_b, Some("write to client failed".into())).await;
                                break;
                            }
                            record_and_decode(&state_b, &sid_b, Direction::UpstreamToClient, opcode, &bytes, &probe_b).await;
                            if is_close {
                                closer_b.finish(&state_b, &sid_b, None).await;
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            closer_b.finish(&state_b, &sid_b, Some(e.to_string())).await;
                            break;
                        }
                        None => {
                            closer_b.finish(&state_b, &sid_b, None).await;
                            break;
                        }
                    }
                }
            }
        }
        let _ = client_sink.close().await;
    });

    let _ = tokio::join!(client_to_upstream, upstream_to_client);
    state.live.unregister(&session_id).await;
    warn!(session_id = %session_id, "ws session ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_http_to_ws() {
        assert_eq!(normalize_ws_target("http://x/socket.io/?EIO=4").unwrap(), "ws://x/socket.io/?EIO=4");
        assert_eq!(normalize_ws_target("https://x").unwrap(), "wss://x");
        assert_eq!(normalize_ws_target("ws://x").unwrap(), "ws://x");
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(normalize_ws_target("ftp://x").is_err());
    }

    #[test]
    fn resolve_target_prefers_target_over_underscore_target() {
        let mut params = HashMap::new();
        params.insert("target".to_string(), "ws://a".to_string());
        params.insert("_target".to_string(), "ws://b".to_string());
        assert_eq!(resolve_target(&params, &None).unwrap(), "ws://a");
    }

    #[test]
    fn resolve_target_falls_back_to_default() {
        let params = HashMap::new();
        assert_eq!(resolve_target(&params, &Some("ws://default".into())).unwrap(), "ws://default");
    }

    #[test]
    fn resolve_target_missing_is_error() {
        let params = HashMap::new();
        assert!(matches!(resolve_target(&params, &None), Err(CoreError::MissingTarget)));
    }
}
