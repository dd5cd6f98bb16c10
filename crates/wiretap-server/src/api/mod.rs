//! Control-plane REST/SSE/WS API (SPEC_FULL.md §4.9/§6).
//!
//! Split along the same lines the teacher's `src-tauri/src/commands/` module
//! uses for its Tauri command surface (one file per concern — sessions,
//! streaming, v1 admin), adapted here to axum handlers instead of `#[tauri::command]`s.

pub mod health;
pub mod sessions;
pub mod stream;
pub mod v1;

use serde_json::Value;

use wiretap_core::CoreError;

/// Shared JSON error envelope for every control-plane handler.
pub fn err_json(err: CoreError) -> (axum::http::StatusCode, axum::Json<Value>) {
    let status = axum::http::StatusCode::from_u16(err.status()).unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    (status, axum::Json(err.to_envelope(None)))
}

/// Parses a `limit`/`offset`/`from` style query param as `usize`, defaulting
/// to 0 (meaning "unbounded"/"from the start") on absence or garbage input.
pub fn parse_usize(params: &std::collections::HashMap<String, String>, key: &str) -> usize {
    params.get(key).and_then(|v| v.parse::<usize>().ok()).unwrap_or(0)
}

pub fn parse_str<'a>(params: &'a std::collections::HashMap<String, String>, key: &str) -> &'a str {
    params.get(key).map(|s| s.as_str()).unwrap_or("")
}
