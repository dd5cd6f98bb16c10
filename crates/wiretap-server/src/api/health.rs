//! `/healthz`, `/readyz`, `/metrics`, `/api/version` (SPEC_FULL.md §6).

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use prometheus::Encoder;
use serde_json::json;

use crate::state::AppState;

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn readyz() -> impl IntoResponse {
    (StatusCode::OK, "ready")
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    let families = state.metrics.registry.gather();
    let encoder = prometheus::TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, encoder.format_type().to_string())],
        buf,
    )
        .into_response()
}

pub async fn version() -> impl IntoResponse {
    axum::Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "time": chrono::Utc::now(),
    }))
}
