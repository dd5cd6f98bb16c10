//! Forward proxy and MITM engine (SPEC_FULL.md §4.4).
//!
//! Handles the two proxy modes that never reach the normal axum router:
//! absolute-URI requests (delegated straight into the HTTP reverse engine)
//! and `CONNECT`, which is hijacked at the raw-connection level the way
//! `hudsucker`'s `process_connect` does it — dial upstream first, reply
//! `200`/`502` accordingly, then either splice raw bytes or, when MITM
//! applies, terminate TLS on both sides and replay HTTP/1.1 requests one at
//! a time over the decrypted tunnel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Method, Request, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex as TokioMutex;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{error, info, warn};

use wiretap_core::domain::{Direction, Opcode, SessionKind};
use wiretap_core::monitor::{MonitorEvent, MonitorEventType};
use wiretap_core::store::{new_frame, new_session};

use crate::capture::{request_preview, response_preview};
use crate::http_reverse;
use crate::state::AppState;
use crate::tls::{build_client_config, build_server_config};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

type ProxyBody = BoxBody<Bytes, hyper::Error>;

fn box_full(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

fn box_empty() -> ProxyBody {
    Empty::new().map_err(|never| match never {}).boxed()
}

fn is_absolute_uri(uri: &Uri) -> bool {
    uri.scheme().is_some() && uri.authority().is_some()
}

fn direction_label(dir: Direction) -> &'static str {
    match dir {
        Direction::ClientToUpstream => "client_to_upstream",
        Direction::UpstreamToClient => "upstream_to_client",
    }
}

fn peer_addr(req: &Request<Body>) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0.to_string())
        .unwrap_or_default()
}

/// Outermost layer (SPEC_FULL.md §4.1): `CONNECT` and absolute-URI requests
/// never reach the inner router/CORS stack at all.
pub async fn layer(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    if req.method() == Method::CONNECT {
        return handle_connect(state, req).await;
    }
    if is_absolute_uri(req.uri()) {
        return handle_absolute_uri(state, req).await;
    }
    next.run(req).await
}

async fn handle_absolute_uri(state: AppState, req: Request<Body>) -> Response {
    let addr: SocketAddr = peer_addr(&req).parse().unwrap_or(([0, 0, 0, 0], 0).into());
    let url = req.uri().to_string();
    http_reverse::proxy_request(state, addr, req, url.clone(), url).await
}

fn connection_established() -> Response {
    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = StatusCode::OK;
    resp.extensions_mut()
        .insert(hyper::ext::ReasonPhrase::from_static(b"Connection Established"));
    resp
}

fn bad_gateway() -> Response {
    StatusCode::BAD_GATEWAY.into_response()
}

async fn handle_connect(state: AppState, mut req: Request<Body>) -> Response {
    let Some(authority) = req.uri().authority().cloned() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let host_port = authority.to_string();
    let host = authority.host().to_string();
    let addr = peer_addr(&req);

    // Dial before deciding 200 vs 502, and before creating a session: a
    // failed dial records no session at all, matching the original.
    let server_stream = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&host_port)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            warn!(target = %host_port, error = %e, "CONNECT dial failed");
            return bad_gateway();
        }
        Err(_) => {
            warn!(target = %host_port, "CONNECT dial timed out");
            return bad_gateway();
        }
    };

    let mitm = state.mitm.read().await.clone();
    let use_mitm = mitm
        .as_ref()
        .map(|m| m.filter.should_intercept(&host))
        .unwrap_or(false);

    let on_upgrade = hyper::upgrade::on(&mut req);

    if let Some(mitm) = mitm.filter(|_| use_mitm) {
        let session = state
            .store
            .create_session(new_session(format!("mitm://{host_port}"), addr, SessionKind::Http))
            .await;
        state.metrics.active_sessions.inc();
        state
            .monitor
            .broadcast(MonitorEvent::new(MonitorEventType::SessionStarted, session.id.clone()))
            .await;

        let issued = match mitm.ca.issue_for(&host) {
            Ok(i) => i,
            Err(e) => {
                state.store.set_closed(&session.id, Some(e.to_string())).await;
                return bad_gateway();
            }
        };
        let server_config = match build_server_config(&issued) {
            Ok(c) => c,
            Err(e) => {
                state.store.set_closed(&session.id, Some(e)).await;
                return bad_gateway();
            }
        };

        let state = state.clone();
        let session_id = session.id.clone();
        let insecure = state.config.insecure_tls;
        tokio::spawn(async move {
            let upgraded = match on_upgrade.await {
                Ok(u) => u,
                Err(e) => {
                    state.store.set_closed(&session_id, Some(e.to_string())).await;
                    return;
                }
            };
            let acceptor = TlsAcceptor::from(Arc::new(server_config));
            let client_tls = match acceptor.accept(TokioIo::new(upgraded)).await {
                Ok(s) => s,
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "MITM TLS handshake with client failed");
                    state.store.set_closed(&session_id, Some(e.to_string())).await;
                    return;
                }
            };

            let connector = TlsConnector::from(Arc::new(build_client_config(insecure)));
            let server_name = match ServerName::try_from(host.clone()) {
                Ok(n) => n,
                Err(_) => {
                    state
                        .store
                        .set_closed(&session_id, Some("invalid server name".to_string()))
                        .await;
                    return;
                }
            };
            let upstream_tls = match connector.connect(server_name, server_stream).await {
                Ok(s) => s,
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "MITM TLS handshake with upstream failed");
                    state.store.set_closed(&session_id, Some(e.to_string())).await;
                    return;
                }
            };

            info!(session_id = %session_id, host = %host, "mitm session started");
            let result = run_mitm_http_loop(state.clone(), session_id.clone(), host.clone(), client_tls, upstream_tls).await;
            match result {
                Ok(()) => state.store.set_closed(&session_id, None).await,
                Err(e) => state.store.set_closed(&session_id, Some(e)).await,
            }
            state.metrics.active_sessions.dec();
            state
                .monitor
                .broadcast(MonitorEvent::new(MonitorEventType::SessionEnded, session_id.clone()))
                .await;
        });

        connection_established()
    } else {
        let session = state
            .store
            .create_session(new_session(format!("connect://{host_port}"), addr, SessionKind::Http))
            .await;
        state.metrics.active_sessions.inc();
        state
            .monitor
            .broadcast(MonitorEvent::new(MonitorEventType::SessionStarted, session.id.clone()))
            .await;

        let state2 = state.clone();
        let session_id = session.id.clone();
        tokio::spawn(async move {
            let mut server_stream = server_stream;
            let result = match on_upgrade.await {
                Ok(upgraded) => {
                    let mut client_io = TokioIo::new(upgraded);
                    tokio::io::copy_bidirectional(&mut client_io, &mut server_stream)
                        .await
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                }
                Err(e) => Err(e.to_string()),
            };
            match result {
                Ok(()) => state2.store.set_closed(&session_id, None).await,
                Err(e) => state2.store.set_closed(&session_id, Some(e)).await,
            }
            state2.metrics.active_sessions.dec();
            state2
                .monitor
                .broadcast(MonitorEvent::new(MonitorEventType::SessionEnded, session_id.clone()))
                .await;
        });

        connection_established()
    }
}

/// Serves HTTP/1.1 off the decrypted client tunnel, replaying each request
/// over a single persistent client connection to the decrypted upstream
/// tunnel. Detects a `101` response and hands both sides off to a raw
/// byte-copy task (SPEC_FULL.md §4.4 step 5).
async fn run_mitm_http_loop<C, U>(
    state: AppState,
    session_id: String,
    host: String,
    client_tls: C,
    upstream_tls: U,
) -> Result<(), String>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    U: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (upstream_send, upstream_conn) = hyper::client::conn::http1::handshake(TokioIo::new(upstream_tls))
        .await
        .map_err(|e| e.to_string())?;
    let session_for_conn = session_id.clone();
    tokio::spawn(async move {
        if let Err(e) = upstream_conn.with_upgrades().await {
            warn!(session_id = %session_for_conn, error = %e, "mitm upstream connection closed");
        }
    });
    let upstream_send = Arc::new(TokioMutex::new(upstream_send));

    let svc_state = state.clone();
    let svc_session_id = session_id.clone();
    let svc_host = host.clone();
    let service = service_fn(move |req: Request<Incoming>| {
        let state = svc_state.clone();
        let session_id = svc_session_id.clone();
        let host = svc_host.clone();
        let upstream_send = upstream_send.clone();
        async move { handle_mitm_request(state, session_id, host, upstream_send, req).await }
    });

    hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(client_tls), service)
        .with_upgrades()
        .await
        .map_err(|e| e.to_string())
}

fn headers_to_reqwest(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        if let (Ok(n), Ok(v)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(n, v);
        }
    }
    out
}

fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = serde_json::json!({"error": {"code": "UPSTREAM_ERROR", "message": message}}).to_string();
    let mut resp = Response::new(box_full(Bytes::from(body)));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(axum::http::header::CONTENT_TYPE, "application/json".parse().unwrap());
    resp
}

async fn handle_mitm_request(
    state: AppState,
    session_id: String,
    host: String,
    upstream_send: Arc<TokioMutex<hyper::client::conn::http1::SendRequest<ProxyBody>>>,
    mut req: Request<Incoming>,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let method = req.method().clone();
    let headers = req.headers().clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/")
        .to_string();

    let on_client_upgrade = hyper::upgrade::on(&mut req);

    let body_bytes = req
        .into_body()
        .collect()
        .await
        .map(|c| c.to_bytes())
        .unwrap_or_default();

    let url = format!("https://{host}{path_and_query}");
    let req_preview = request_preview(&state.config, method.as_str(), &url, &headers_to_reqwest(&headers), &body_bytes);
    let req_frame = new_frame(Direction::ClientToUpstream, Opcode::Text, body_bytes.as_ref(), req_preview.to_string());
    let req_frame_id = req_frame.id.clone();
    state.store.append_frame(&session_id, req_frame).await;
    state
        .metrics
        .frames_total
        .with_label_values(&[direction_label(Direction::ClientToUpstream)])
        .inc();
    state
        .monitor
        .broadcast(MonitorEvent::new(MonitorEventType::FrameAdded, session_id.clone()).with_ref(req_frame_id))
        .await;

    let mut out_builder = Request::builder().method(method).uri(path_and_query);
    for (name, value) in headers.iter() {
        if name != axum::http::header::HOST {
            out_builder = out_builder.header(name, value);
        }
    }
    out_builder = out_builder.header(axum::http::header::HOST, host.clone());
    let out_req = out_builder
        .body(box_full(body_bytes.clone()))
        .expect("mitm request is well-formed");

    let mut sender = upstream_send.lock().await;
    if sender.ready().await.is_err() {
        return Ok(error_response(StatusCode::BAD_GATEWAY, "upstream connection unavailable"));
    }
    let upstream_resp = match sender.send_request(out_req).await {
        Ok(r) => r,
        Err(e) => return Ok(error_response(StatusCode::BAD_GATEWAY, &e.to_string())),
    };
    drop(sender);

    let status = upstream_resp.status();
    let resp_headers = upstream_resp.headers().clone();

    if status == StatusCode::SWITCHING_PROTOCOLS {
        let state2 = state.clone();
        let session_id2 = session_id.clone();
        let mut upstream_resp = upstream_resp;
        let on_upstream_upgrade = hyper::upgrade::on(&mut upstream_resp);
        tokio::spawn(async move {
            let client_up = match on_client_upgrade.await {
                Ok(u) => u,
                Err(e) => {
                    warn!(session_id = %session_id2, error = %e, "mitm client-side upgrade failed");
                    return;
                }
            };
            let upstream_up = match on_upstream_upgrade.await {
                Ok(u) => u,
                Err(e) => {
                    warn!(session_id = %session_id2, error = %e, "mitm upstream-side upgrade failed");
                    return;
                }
            };
            let mut client_io = TokioIo::new(client_up);
            let mut upstream_io = TokioIo::new(upstream_up);
            if let Err(e) = tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
                warn!(session_id = %session_id2, error = %e, "mitm raw copy ended");
            }
            state2.store.set_closed(&session_id2, None).await;
        });

        let mut out = Response::new(box_empty());
        *out.status_mut() = status;
        *out.headers_mut() = resp_headers;
        return Ok(out);
    }

    let resp_body = upstream_resp
        .into_body()
        .collect()
        .await
        .map(|c| c.to_bytes())
        .unwrap_or_default();

    let resp_preview = response_preview(&state.config, status.as_u16(), &headers_to_reqwest(&resp_headers), &resp_body, 0, 0);
    let resp_frame = new_frame(Direction::UpstreamToClient, Opcode::Text, resp_body.as_ref(), resp_preview.to_string());
    let resp_frame_id = resp_frame.id.clone();
    state.store.append_frame(&session_id, resp_frame).await;
    state
        .metrics
        .frames_total
        .with_label_values(&[direction_label(Direction::UpstreamToClient)])
        .inc();
    state
        .monitor
        .broadcast(MonitorEvent::new(MonitorEventType::FrameAdded, session_id.clone()).with_ref(resp_frame_id))
        .await;

    let mut out = Response::new(box_full(resp_body));
    *out.status_mut() = status;
    *out.headers_mut() = resp_headers;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_uri_detection() {
        let abs: Uri = "http://example.com/foo".parse().unwrap();
        let rel: Uri = "/foo".parse().unwrap();
        assert!(is_absolute_uri(&abs));
        assert!(!is_absolute_uri(&rel));
    }
}
