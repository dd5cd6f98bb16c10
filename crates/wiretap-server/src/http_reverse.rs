//! HTTP reverse-proxy engine (SPEC_FULL.md §4.3).
//!
//! Ported from the teacher's `http_proxy.rs` `proxy_handler`: build an
//! upstream URL, forward the request body and a filtered header set through
//! `reqwest`, stream the response back. Unlike the teacher, every request
//! also becomes a recorded `Session` + `HttpTransaction` pair, with preview
//! construction and optional body spooling layered on top of the plain
//! proxy plumbing.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use rand::Rng;
use tracing::warn;

use wiretap_core::domain::{HttpTimings, HttpTransaction, SessionKind};
use wiretap_core::monitor::{MonitorEvent, MonitorEventType};
use wiretap_core::store::new_session;
use wiretap_core::{CoreError, ResponseDelay};

use crate::capture::{request_preview, response_preview, spool_body};
use crate::state::AppState;
use crate::ws_proxy::error_response;

const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

fn resolve_target(params: &std::collections::HashMap<String, String>, default_target: &Option<String>) -> Result<String, CoreError> {
    params
        .get("target")
        .or_else(|| params.get("_target"))
        .cloned()
        .or_else(|| default_target.clone())
        .ok_or(CoreError::MissingTarget)
}

fn compose_url(target: &str, req_path_and_query: Option<&str>) -> Result<String, CoreError> {
    if !target.starts_with("http://") && !target.starts_with("https://") {
        return Err(CoreError::InvalidTarget(target.to_string()));
    }
    let base = target.trim_end_matches('/');
    match req_path_and_query {
        Some(p) if !p.is_empty() && p != "/" => Ok(format!("{base}{p}")),
        _ => Ok(base.to_string()),
    }
}

fn filtered_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        let lower = name.as_str().to_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str()) {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(n, v);
        }
    }
    out
}

fn axum_headers_from_reqwest(headers: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        let lower = name.as_str().to_lowercase();
        if lower == "transfer-encoding" || lower == "connection" {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(n, v);
        }
    }
    out
}

/// Strips a known proxy mount prefix (`/httpproxy`, `/proxy`, their `/_api/v1`
/// mirrors) off a request path, leaving the path suffix to append after the
/// upstream target (SPEC_FULL.md §4.3 "append the path suffix after the
/// mount prefix"). Absolute-URI forwards never go through this — they reuse
/// the request URI verbatim via `forward_proxy::handle_absolute_uri`.
const MOUNT_PREFIXES: &[&str] = &["/_api/v1/httpproxy", "/httpproxy", "/proxy"];

fn path_suffix(uri_path: &str) -> &str {
    for prefix in MOUNT_PREFIXES {
        if let Some(rest) = uri_path.strip_prefix(prefix) {
            if rest.is_empty() || rest.starts_with('/') {
                return rest;
            }
        }
    }
    ""
}

/// Reassembles the raw query string with `target`/`_target` removed, so
/// every other query parameter is forwarded to the upstream unchanged.
fn query_without_target(query: &str) -> Option<String> {
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let key = pair.splitn(2, '=').next().unwrap_or("");
            key != "target" && key != "_target"
        })
        .collect();
    if kept.is_empty() {
        None
    } else {
        Some(kept.join("&"))
    }
}

/// `GET /proxy?target=...` / `POST /httpproxy?target=...` entry point.
pub async fn handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    let uri = req.uri().clone();
    let params: std::collections::HashMap<String, String> = uri
        .query()
        .map(|q| {
            url_encoded_pairs(q)
                .into_iter()
                .collect()
        })
        .unwrap_or_default();

    let target = match resolve_target(&params, &state.config.default_target) {
        Ok(t) => t,
        Err(e) => return error_response(e),
    };

    let suffix = path_suffix(uri.path());
    let remaining_query = uri.query().and_then(query_without_target);
    let path_and_query = match remaining_query {
        Some(q) => format!("{suffix}?{q}"),
        None => suffix.to_string(),
    };
    let req_path_and_query = if path_and_query.is_empty() { None } else { Some(path_and_query.as_str()) };

    let url = match compose_url(&target, req_path_and_query) {
        Ok(u) => u,
        Err(e) => return error_response(e),
    };

    proxy_request(state, addr, req, url, target).await
}

/// Splits a raw query string into `(key, value)` pairs without pulling in a
/// dedicated form-encoding crate; `target=`/`_target=` values are themselves
/// full URLs and may contain their own `&`/`=`, so this only decodes percent
/// escapes, it does not attempt nested-query parsing.
fn url_encoded_pairs(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter_map(|pair| {
            let mut it = pair.splitn(2, '=');
            let k = it.next()?;
            let v = it.next().unwrap_or("");
            Some((percent_decode(k), percent_decode(v)))
        })
        .collect()
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                if let Ok(byte) = u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""), 16) {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).to_string()
}

/// Best-effort DNS/connect/TLS timing, measured via a side probe against the
/// same host `reqwest` is about to dial. This duplicates a connection
/// attempt rather than instrumenting `reqwest`'s own connector (which has no
/// public per-phase hook), so it only runs when a request is being recorded,
/// never on the hot path of a plain (non-capturing) proxy. Any failure
/// leaves the corresponding field at 0, matching SPEC_FULL.md §4.3's
/// "missing instants stay zero" allowance.
async fn probe_connect_phases(url: &str, insecure_tls: bool) -> (i64, i64, i64) {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return (0, 0, 0);
    };
    let Some(host) = parsed.host_str() else {
        return (0, 0, 0);
    };
    let is_tls = parsed.scheme() == "https";
    let port = parsed.port_or_known_default().unwrap_or(if is_tls { 443 } else { 80 });
    let hostport = format!("{host}:{port}");

    let dns_start = Instant::now();
    let addr = match tokio::time::timeout(Duration::from_secs(5), tokio::net::lookup_host(&hostport)).await {
        Ok(Ok(mut addrs)) => match addrs.next() {
            Some(a) => a,
            None => return (0, 0, 0),
        },
        _ => return (0, 0, 0),
    };
    let dns_ms = dns_start.elapsed().as_millis() as i64;

    let connect_start = Instant::now();
    let stream = match tokio::time::timeout(Duration::from_secs(10), tokio::net::TcpStream::connect(addr)).await {
        Ok(Ok(s)) => s,
        _ => return (dns_ms, 0, 0),
    };
    let connect_ms = connect_start.elapsed().as_millis() as i64;

    if !is_tls {
        return (dns_ms, connect_ms, 0);
    }

    let Ok(server_name) = rustls::pki_types::ServerName::try_from(host.to_string()) else {
        return (dns_ms, connect_ms, 0);
    };
    let connector = tokio_rustls::TlsConnector::from(std::sync::Arc::new(crate::tls::build_client_config(insecure_tls)));
    let tls_start = Instant::now();
    let tls_ms = match tokio::time::timeout(Duration::from_secs(10), connector.connect(server_name, stream)).await {
        Ok(Ok(_)) => tls_start.elapsed().as_millis() as i64,
        _ => 0,
    };
    (dns_ms, connect_ms, tls_ms)
}

async fn apply_response_delay(state: &AppState) {
    match state.current_response_delay().await {
        ResponseDelay::None => {}
        ResponseDelay::Fixed(ms) => tokio::time::sleep(std::time::Duration::from_millis(ms as u64)).await,
        ResponseDelay::Range(min, max) => {
            let ms = if max > min {
                rand::thread_rng().gen_range(min..=max)
            } else {
                min
            };
            tokio::time::sleep(std::time::Duration::from_millis(ms as u64)).await;
        }
    }
}

pub async fn proxy_request(
    state: AppState,
    addr: SocketAddr,
    req: Request<Body>,
    url: String,
    recorded_target: String,
) -> Response {
    let method = req.method().clone();
    let headers = req.headers().clone();
    let (req_body, req_size) = match to_bytes(req.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => {
            let len = b.len();
            (b, len)
        }
        Err(e) => {
            return error_response(CoreError::BadValue(format!("request body: {e}")));
        }
    };

    let session = state
        .store
        .create_session(new_session(recorded_target.clone(), addr.to_string(), SessionKind::Http))
        .await;
    state
        .monitor
        .broadcast(MonitorEvent::new(MonitorEventType::SessionStarted, session.id.clone()))
        .await;

    let req_preview = request_preview(&state.config, method.as_str(), &url, &filtered_headers(&headers), &req_body);
    let req_frame = wiretap_core::store::new_frame(
        wiretap_core::domain::Direction::ClientToUpstream,
        wiretap_core::domain::Opcode::Text,
        req_body.as_ref(),
        req_preview.to_string(),
    );
    state.store.append_frame(&session.id, req_frame).await;

    let progress_frame = wiretap_core::store::new_frame(
        wiretap_core::domain::Direction::ClientToUpstream,
        wiretap_core::domain::Opcode::Text,
        b"",
        serde_json::json!({"type": "http_progress", "phase": "started"}).to_string(),
    );
    state.store.append_frame(&session.id, progress_frame).await;

    let started = Instant::now();
    let started_at = Utc::now();
    let (dns_ms, connect_ms, tls_ms) = probe_connect_phases(&url, state.config.insecure_tls).await;

    let method_reqwest = match reqwest::Method::from_bytes(method.as_str().as_bytes()) {
        Ok(m) => m,
        Err(_) => return error_response(CoreError::BadValue("invalid method".into())),
    };
    let mut builder = state
        .http_client
        .request(method_reqwest, &url)
        .headers(filtered_headers(&headers));
    if !req_body.is_empty() {
        builder = builder.body(req_body.to_vec());
    }

    let ttfb_start = Instant::now();
    let resp = match builder.send().await {
        Ok(r) => r,
        Err(e) => {
            let msg = e.to_string();
            let code = wiretap_core::classify_network_error(&msg);
            state.store.set_closed(&session.id, Some(msg.clone())).await;
            state
                .monitor
                .broadcast(MonitorEvent::new(MonitorEventType::SessionError, session.id.clone()).with_error(msg.clone()))
                .await;
            warn!(session_id = %session.id, target = %url, error = %msg, code, "upstream request failed");
            return error_response(CoreError::UpstreamError(msg));
        }
    };
    let ttfb_ms = ttfb_start.elapsed().as_millis() as i64;

    apply_response_delay(&state).await;

    let status = resp.status();
    let resp_headers = resp.headers().clone();
    let content_type = resp_headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let resp_body = match resp.bytes().await {
        Ok(b) => b,
        Err(e) => {
            let msg = e.to_string();
            state.store.set_closed(&session.id, Some(msg.clone())).await;
            state
                .monitor
                .broadcast(MonitorEvent::new(MonitorEventType::SessionError, session.id.clone()).with_error(msg.clone()))
                .await;
            return error_response(CoreError::UpstreamError(msg));
        }
    };
    let total_ms = started.elapsed().as_millis() as i64;

    let resp_preview = response_preview(&state.config, status.as_u16(), &resp_headers, &resp_body, ttfb_ms, total_ms);
    let resp_frame = wiretap_core::store::new_frame(
        wiretap_core::domain::Direction::UpstreamToClient,
        wiretap_core::domain::Opcode::Text,
        resp_body.as_ref(),
        resp_preview.to_string(),
    );
    state.store.append_frame(&session.id, resp_frame).await;

    let req_body_file = spool_body(&state.config, &req_body, "req");
    let resp_body_file = spool_body(&state.config, &resp_body, "resp");

    let tx = HttpTransaction {
        id: uuid::Uuid::new_v4().to_string(),
        session_id: session.id.clone(),
        method: method.to_string(),
        url: url.clone(),
        status: status.as_u16(),
        req_size,
        resp_size: resp_body.len(),
        started_at,
        ended_at: Utc::now(),
        timings: HttpTimings {
            dns_ms,
            connect_ms,
            tls_ms,
            ttfb_ms,
            total_ms,
        },
        content_type,
        req_body_file,
        resp_body_file,
    };
    state.store.append_http_transaction(tx).await;
    state.metrics.http_tx_total.inc();
    state
        .monitor
        .broadcast(MonitorEvent::new(MonitorEventType::HttpTxAdded, session.id.clone()))
        .await;

    state.store.set_closed(&session.id, None).await;
    state
        .monitor
        .broadcast(MonitorEvent::new(MonitorEventType::SessionEnded, session.id.clone()))
        .await;

    let mut out = Response::builder().status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY));
    *out.headers_mut().unwrap() = axum_headers_from_reqwest(&resp_headers);
    out.body(Body::from(resp_body)).unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_url_rejects_non_http_target() {
        assert!(compose_url("ftp://x", None).is_err());
    }

    #[test]
    fn compose_url_trims_trailing_slash() {
        assert_eq!(compose_url("http://x/", None).unwrap(), "http://x");
    }

    #[test]
    fn percent_decode_handles_space_and_escapes() {
        assert_eq!(percent_decode("a%20b+c%2Fd"), "a b c/d");
    }

    #[test]
    fn url_encoded_pairs_splits_on_first_equals_only() {
        let pairs = url_encoded_pairs("target=http://x/y?z=1&other=2");
        assert_eq!(pairs[0], ("target".to_string(), "http://x/y?z=1".to_string()));
        assert_eq!(pairs[1], ("other".to_string(), "2".to_string()));
    }
}
