//! Session/frame/event/HTTP-transaction REST endpoints (SPEC_FULL.md §6).

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use wiretap_core::domain::Event;
use wiretap_core::monitor::{MonitorEvent, MonitorEventType};
use wiretap_core::store::{CaptureFilter, SessionFilter};
use wiretap_core::CoreError;

use super::{err_json, parse_usize};
use crate::state::AppState;

fn event_to_json(e: &Event) -> Value {
    let mut v = serde_json::to_value(e).unwrap_or(Value::Null);
    if let Some(obj) = v.as_object_mut() {
        obj.insert("event".to_string(), json!(e.name));
    }
    v
}

fn capture_filter_from_query(params: &HashMap<String, String>) -> (Option<CaptureFilter>, bool) {
    match params.get("captureId").map(|s| s.as_str()) {
        Some("current") => (Some(CaptureFilter::Current), false),
        Some(other) => match other.parse::<i64>() {
            Ok(n) => (Some(CaptureFilter::Exact(n)), false),
            Err(_) => (None, false),
        },
        None => (None, params.get("includeUnassigned").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(true)),
    }
}

/// `GET /api/sessions?q=&target=&limit=&offset=&captureId=`
pub async fn list(State(state): State<AppState>, Query(params): Query<HashMap<String, String>>) -> Response {
    let (capture_id, include_unassigned) = capture_filter_from_query(&params);
    let filter = SessionFilter {
        q: params.get("q").cloned().unwrap_or_default(),
        target: params.get("target").or_else(|| params.get("_target")).cloned().unwrap_or_default(),
        capture_id,
        include_unassigned,
        limit: parse_usize(&params, "limit"),
        offset: parse_usize(&params, "offset"),
    };
    let (items, total) = state.store.list_sessions(&filter).await;
    Json(json!({"items": items, "total": total})).into_response()
}

/// `DELETE /api/sessions` — clears the store, closes live WS sessions, and
/// broadcasts `sessions_cleared`.
pub async fn clear_all(State(state): State<AppState>) -> StatusCode {
    let (items, _) = state.store.list_sessions(&SessionFilter { include_unassigned: true, ..Default::default() }).await;
    for s in items {
        state.live.unregister(&s.id).await;
    }
    state.store.clear_all_sessions().await;
    state
        .monitor
        .broadcast(MonitorEvent::new(MonitorEventType::SessionsCleared, ""))
        .await;
    StatusCode::NO_CONTENT
}

/// `GET /api/sessions/{id}`
pub async fn get(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.get_session(&id).await {
        Some(s) => Json(s).into_response(),
        None => err_json(CoreError::NotFound).into_response(),
    }
}

/// `DELETE /api/sessions/{id}`
pub async fn delete(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    state.live.unregister(&id).await;
    state.store.delete_session(&id).await;
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub limit: usize,
}

/// `GET /api/sessions/{id}/frames?from=&limit=`
pub async fn frames(State(state): State<AppState>, Path(id): Path<String>, Query(q): Query<PageQuery>) -> Response {
    let (items, next) = state.store.list_frames(&id, &q.from, q.limit).await;
    Json(json!({"items": items, "next": next})).into_response()
}

/// `GET /api/sessions/{id}/events?from=&limit=`
pub async fn events(State(state): State<AppState>, Path(id): Path<String>, Query(q): Query<PageQuery>) -> Response {
    let (items, next) = state.store.list_events(&id, &q.from, q.limit).await;
    let items: Vec<Value> = items.iter().map(event_to_json).collect();
    Json(json!({"items": items, "next": next})).into_response()
}

/// `GET /api/sessions/{id}/http?from=&limit=`
pub async fn http_transactions(State(state): State<AppState>, Path(id): Path<String>, Query(q): Query<PageQuery>) -> Response {
    let (items, next) = state.store.list_http_transactions(&id, &q.from, q.limit).await;
    Json(json!({"items": items, "next": next})).into_response()
}

/// `GET /api/sessions/{id}/export` — full transcript, unpaginated.
pub async fn export(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(session) = state.store.get_session(&id).await else {
        return err_json(CoreError::NotFound).into_response();
    };
    let (frames, _) = state.store.list_frames(&id, "", 0).await;
    let (events, _) = state.store.list_events(&id, "", 0).await;
    let (http, _) = state.store.list_http_transactions(&id, "", 0).await;
    let events: Vec<Value> = events.iter().map(event_to_json).collect();
    let body = json!({"session": session, "frames": frames, "events": events, "http": http});
    let filename = format!("wiretap-session-{id}.json");
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\"")),
        ],
        body.to_string(),
    )
        .into_response()
}

/// `GET /api/sessions/{id}/har` — HAR 1.2 download built from the session's
/// recorded HTTP transactions. Request/response header detail beyond what
/// `HttpTransaction` stores (full header sets, exact body bytes) is outside
/// this crate's scope; entries carry the fields the store actually has.
pub async fn har(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(_session) = state.store.get_session(&id).await else {
        return err_json(CoreError::NotFound).into_response();
    };
    let (txs, _) = state.store.list_http_transactions(&id, "", 0).await;

    let entries: Vec<Value> = txs
        .iter()
        .map(|tx| {
            json!({
                "startedDateTime": tx.started_at.to_rfc3339(),
                "time": tx.timings.total_ms,
                "request": {
                    "method": tx.method,
                    "url": tx.url,
                    "httpVersion": "HTTP/1.1",
                    "headers": [],
                    "queryString": [],
                    "bodySize": tx.req_size,
                },
                "response": {
                    "status": tx.status,
                    "statusText": "",
                    "httpVersion": "HTTP/1.1",
                    "headers": [],
                    "content": {
                        "size": tx.resp_size,
                        "mimeType": tx.content_type.clone().unwrap_or_default(),
                    },
                    "bodySize": tx.resp_size,
                },
                "cache": {},
                "timings": {
                    "dns": tx.timings.dns_ms,
                    "connect": tx.timings.connect_ms,
                    "ssl": tx.timings.tls_ms,
                    "wait": tx.timings.ttfb_ms,
                    "receive": (tx.timings.total_ms - tx.timings.ttfb_ms).max(0),
                    "send": 0,
                },
            })
        })
        .collect();

    let har = json!({
        "log": {
            "version": "1.2",
            "creator": {"name": "wiretap", "version": env!("CARGO_PKG_VERSION")},
            "entries": entries,
        }
    });
    let filename = format!("wiretap-session-{id}.har");
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\"")),
        ],
        har.to_string(),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct WsSendBody {
    pub direction: String,
    pub payload: String,
}

/// `POST /api/sessions/{id}/ws/send {direction, payload}` — injects a text
/// frame into a live WS session.
pub async fn ws_send(State(state): State<AppState>, Path(id): Path<String>, Json(body): Json<WsSendBody>) -> Response {
    let direction = match body.direction.as_str() {
        "client->upstream" | "client_to_upstream" => wiretap_core::domain::Direction::ClientToUpstream,
        "upstream->client" | "upstream_to_client" => wiretap_core::domain::Direction::UpstreamToClient,
        other => return err_json(CoreError::BadValue(format!("unknown direction: {other}"))).into_response(),
    };
    match state.live.send_text(&id, direction, body.payload).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => err_json(e).into_response(),
    }
}
