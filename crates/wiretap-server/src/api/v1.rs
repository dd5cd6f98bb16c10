//! `/_api/v1/*` admin mirror: capture control, runtime settings, MITM admin,
//! session aggregates (SPEC_FULL.md §6).

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use wiretap_core::monitor::{MonitorEvent, MonitorEventType};
use wiretap_core::store::SessionFilter;
use wiretap_core::{CertAuthority, CoreError, ResponseDelay};

use super::err_json;
use crate::state::{AppState, Mitm};

#[derive(Debug, Deserialize)]
pub struct CaptureAction {
    pub action: String,
}

/// `GET /_api/v1/capture` — current recording state.
pub async fn capture_get(State(state): State<AppState>) -> Response {
    let (recording, current) = state.store.recording_state().await;
    Json(json!({"recording": recording, "currentCapture": current})).into_response()
}

/// `POST /_api/v1/capture {action: start|stop}`
pub async fn capture_post(State(state): State<AppState>, Json(body): Json<CaptureAction>) -> Response {
    let current = match body.action.as_str() {
        "start" => state.store.start_capture().await,
        "stop" => state.store.stop_capture().await,
        other => return err_json(CoreError::BadAction(other.to_string())).into_response(),
    };
    let (recording, _) = state.store.recording_state().await;
    state
        .monitor
        .broadcast(MonitorEvent::new(MonitorEventType::CaptureChanged, current.to_string()))
        .await;
    Json(json!({"recording": recording, "currentCapture": current})).into_response()
}

/// `GET /_api/v1/sessions/aggregate` — totals across every recorded session,
/// supplementing SPEC_FULL.md §6's wire surface with a summary view the
/// distilled spec names but doesn't detail the shape of.
pub async fn aggregate(State(state): State<AppState>) -> Response {
    let (items, total) = state.store.list_sessions(&SessionFilter { include_unassigned: true, ..Default::default() }).await;
    let (recording, current_capture) = state.store.recording_state().await;

    let mut ws_count = 0usize;
    let mut http_count = 0usize;
    let mut total_frames = 0u64;
    let mut total_events = 0u64;
    let mut open_count = 0usize;
    for s in &items {
        match s.kind {
            wiretap_core::domain::SessionKind::Ws => ws_count += 1,
            wiretap_core::domain::SessionKind::Http => http_count += 1,
        }
        total_frames += s.frames.total;
        total_events += s.events.total;
        if s.closed_at.is_none() {
            open_count += 1;
        }
    }

    Json(json!({
        "totalSessions": total,
        "openSessions": open_count,
        "byKind": {"ws": ws_count, "http": http_count},
        "totalFrames": total_frames,
        "totalEvents": total_events,
        "recording": recording,
        "currentCapture": current_capture,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct SettingsBody {
    /// Either a bare non-negative integer or a `min-max` range, same grammar
    /// as `RESPONSE_DELAY_MS`. Empty/absent clears the delay.
    #[serde(default)]
    pub response_delay_ms: Option<String>,
}

/// `GET /_api/v1/settings`
pub async fn settings_get(State(state): State<AppState>) -> Response {
    Json(response_delay_json(state.current_response_delay().await)).into_response()
}

/// `POST /_api/v1/settings` — reconfigures the runtime response delay.
pub async fn settings_post(State(state): State<AppState>, Json(body): Json<SettingsBody>) -> Response {
    let delay = match body.response_delay_ms.as_deref() {
        None | Some("") => ResponseDelay::None,
        Some(raw) => wiretap_core::config::parse_response_delay(raw),
    };
    *state.response_delay.write().await = delay;
    state
        .monitor
        .broadcast(MonitorEvent::new(MonitorEventType::SettingsChanged, ""))
        .await;
    Json(response_delay_json(delay)).into_response()
}

fn response_delay_json(delay: ResponseDelay) -> serde_json::Value {
    match delay {
        ResponseDelay::None => json!({"responseDelayMs": null}),
        ResponseDelay::Fixed(ms) => json!({"responseDelayMs": ms.to_string()}),
        ResponseDelay::Range(min, max) => json!({"responseDelayMs": format!("{min}-{max}")}),
    }
}

/// `GET /_api/v1/mitm/status`
pub async fn mitm_status(State(state): State<AppState>) -> Response {
    let mitm = state.mitm.read().await;
    let enabled = mitm.is_some();
    let (allow, deny) = mitm
        .as_ref()
        .map(|m| (m.filter.allow_suffix.clone(), m.filter.deny_suffix.clone()))
        .unwrap_or_default();
    Json(json!({
        "enabled": enabled,
        "hasCA": enabled,
        "allow": allow,
        "deny": deny,
    }))
    .into_response()
}

/// `GET /_api/v1/mitm/ca` — downloads the active root CA certificate PEM.
pub async fn mitm_ca(State(state): State<AppState>) -> Response {
    let mitm = state.mitm.read().await;
    match mitm.as_ref() {
        Some(m) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/x-pem-file".to_string()),
                (header::CONTENT_DISPOSITION, "attachment; filename=\"wiretap-ca.pem\"".to_string()),
            ],
            m.ca.ca_cert_pem(),
        )
            .into_response(),
        None => err_json(CoreError::NotFound).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct MitmGenerateBody {
    #[serde(default)]
    pub cn: Option<String>,
}

/// `POST /_api/v1/mitm/generate {cn?}` — mints a fresh dev CA and hot-swaps
/// it into the active `Mitm`. Gated by `MITM_ALLOW_CA_GENERATE` (default
/// off): this endpoint hands the caller the CA's private key.
pub async fn mitm_generate(State(state): State<AppState>, Json(body): Json<MitmGenerateBody>) -> Response {
    if !state.config.mitm_allow_ca_generate {
        return err_json(CoreError::CaGenerateFailed("CA generation is disabled".to_string())).into_response();
    }
    let cn = body.cn.unwrap_or_else(|| "wiretap dev CA".to_string());
    let (cert_pem, key_pem) = match CertAuthority::generate_dev_ca(&cn, 0) {
        Ok(pair) => pair,
        Err(e) => return err_json(CoreError::CaGenerateFailed(e.to_string())).into_response(),
    };

    let mut guard = state.mitm.write().await;
    match guard.as_ref() {
        Some(mitm) => {
            if let Err(e) = mitm.ca.swap_ca(cert_pem.clone(), key_pem.as_bytes()) {
                return err_json(e).into_response();
            }
        }
        None => {
            let new_ca = match CertAuthority::load_from_pem(cert_pem.as_bytes(), key_pem.as_bytes()) {
                Ok(ca) => ca,
                Err(e) => return err_json(e).into_response(),
            };
            let filter = wiretap_core::DomainFilter {
                allow_suffix: state.config.mitm_allow_suffixes.clone(),
                deny_suffix: state.config.mitm_deny_suffixes.clone(),
            };
            *guard = Some(std::sync::Arc::new(Mitm { ca: new_ca, filter }));
        }
    }
    drop(guard);

    Json(json!({"certPem": cert_pem, "keyPem": key_pem})).into_response()
}
