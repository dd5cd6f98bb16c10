//! Router / Dispatcher (SPEC_FULL.md §4.1).
//!
//! Classification priority, highest first:
//!   1. `CONNECT` / absolute-URI requests — intercepted by `forward_proxy::layer`,
//!      an outer middleware that never reaches anything below it. Only
//!      mounted on the plain listener; the TLS listener is REST/reverse-only.
//!   2. `/proxy[/*]` — auto-dispatches to the WS or HTTP reverse engine
//!      depending on the `Upgrade` header.
//!   3. `/wsproxy[/*]`, `/httpproxy[/*]` — explicit reverse-proxy engines.
//!   4. Control-plane routes (`/api/*`, `/_api/v1/*`, `/healthz`, `/readyz`, `/metrics`).
//!   5. 404 fallback.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, FromRequestParts, Query, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::api::{health, sessions, stream, v1};
use crate::state::AppState;
use crate::{forward_proxy, http_reverse, ws_proxy};

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade_is_ws = headers
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection_has_upgrade = headers
        .get(axum::http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);
    upgrade_is_ws && connection_has_upgrade
}

/// `/proxy[/*]` auto-dispatch: a WS-upgrade request goes to the WS reverse
/// engine, anything else goes to the HTTP reverse engine.
async fn proxy_dispatch(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    let (mut parts, body) = req.into_parts();
    if is_websocket_upgrade(&parts.headers) {
        let query = Query::<HashMap<String, String>>::from_request_parts(&mut parts, &state)
            .await
            .map(|Query(q)| q)
            .unwrap_or_default();
        let headers = parts.headers.clone();
        match axum::extract::ws::WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
            Ok(ws) => ws_proxy::handler(State(state), Query(query), headers, ConnectInfo(addr), ws).await,
            Err(rejection) => rejection.into_response(),
        }
    } else {
        let req = Request::from_parts(parts, body);
        http_reverse::handler(State(state), ConnectInfo(addr), req).await
    }
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        axum::Json(wiretap_core::CoreError::NotFound.to_envelope(None)),
    )
        .into_response()
}

fn cors_layer(allow_origin: &str) -> CorsLayer {
    let origin = if allow_origin == "*" {
        AllowOrigin::any()
    } else {
        allow_origin
            .parse()
            .map(AllowOrigin::exact)
            .unwrap_or_else(|_| AllowOrigin::any())
    };
    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            axum::http::header::COOKIE,
            axum::http::HeaderName::from_static("sec-websocket-protocol"),
        ])
}

fn control_plane_routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/metrics", get(health::metrics))
        .route("/api/version", get(health::version))
        .route("/api/sessions", get(sessions::list).delete(sessions::clear_all))
        .route("/api/sessions/:id", get(sessions::get).delete(sessions::delete))
        .route("/api/sessions/:id/frames", get(sessions::frames))
        .route("/api/sessions/:id/events", get(sessions::events))
        .route("/api/sessions/:id/http", get(sessions::http_transactions))
        .route("/api/sessions/:id/har", get(sessions::har))
        .route("/api/sessions/:id/export", get(sessions::export))
        .route("/api/sessions/:id/ws/send", post(sessions::ws_send))
        .route("/api/sessions_stream/:id", get(stream::session_stream))
        .route("/api/monitor/ws", get(stream::monitor_ws))
        // V1 mirror.
        .route("/_api/v1/version", get(health::version))
        .route("/_api/v1/sessions", get(sessions::list).delete(sessions::clear_all))
        .route("/_api/v1/sessions/:id", get(sessions::get).delete(sessions::delete))
        .route("/_api/v1/sessions/aggregate", get(v1::aggregate))
        .route("/_api/v1/monitor/ws", get(stream::monitor_ws))
        .route("/_api/v1/httpproxy", any(http_reverse::handler))
        .route("/_api/v1/httpproxy/*path", any(http_reverse::handler))
        .route("/_api/v1/capture", get(v1::capture_get).post(v1::capture_post))
        .route("/_api/v1/settings", get(v1::settings_get).post(v1::settings_post))
        .route("/_api/v1/mitm/status", get(v1::mitm_status))
        .route("/_api/v1/mitm/ca", get(v1::mitm_ca))
        .route("/_api/v1/mitm/generate", post(v1::mitm_generate))
}

fn proxy_routes() -> Router<AppState> {
    Router::new()
        .route("/wsproxy", any(ws_proxy::handler))
        .route("/wsproxy/*path", any(ws_proxy::handler))
        .route("/httpproxy", any(http_reverse::handler))
        .route("/httpproxy/*path", any(http_reverse::handler))
        .route("/proxy", any(proxy_dispatch))
        .route("/proxy/*path", any(proxy_dispatch))
}

/// Builds the full router. `with_forward_proxy` mounts the outer `CONNECT`/
/// absolute-URI interception layer; the TLS listener never sets this, since
/// SPEC_FULL.md §6 reserves the forward proxy for the plain listener.
pub fn build_router(state: AppState, with_forward_proxy: bool) -> Router {
    let cors = cors_layer(&state.config.cors_allow_origin);

    let mut router = control_plane_routes()
        .merge(proxy_routes())
        .fallback(not_found)
        .with_state(state.clone());

    if with_forward_proxy {
        router = router.layer(axum::middleware::from_fn_with_state(state.clone(), forward_proxy::layer));
    }

    router.layer(cors)
}
