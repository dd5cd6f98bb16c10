//! Centralized error type for the proxy core.
//!
//! Every fallible operation in this crate returns `wiretap_core::Result<T>`. The
//! variant name doubles as the wire error code (see `code()`), matching the
//! `{error:{code,message,details}}` envelope the control plane emits.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("target is required")]
    MissingTarget,

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("upstream error: {0}")]
    UpstreamError(String),

    #[error("failed to create session: {0}")]
    SessionCreateFailed(String),

    #[error("failed to list sessions: {0}")]
    SessionsListFailed(String),

    #[error("failed to get session: {0}")]
    SessionGetFailed(String),

    #[error("failed to list frames: {0}")]
    FramesListFailed(String),

    #[error("failed to list events: {0}")]
    EventsListFailed(String),

    #[error("failed to list http transactions: {0}")]
    HttpListFailed(String),

    #[error("not found")]
    NotFound,

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("invalid json: {0}")]
    BadJson(String),

    #[error("invalid value: {0}")]
    BadValue(String),

    #[error("invalid action: {0}")]
    BadAction(String),

    #[error("connection hijacking not supported")]
    HijackNotSupported,

    #[error("streaming not supported")]
    StreamUnsupported,

    #[error("live session registry unavailable")]
    LiveUnavailable,

    #[error("failed to send: {0}")]
    SendFailed(String),

    #[error("capture control unavailable")]
    CaptureUnavailable,

    #[error("failed to generate CA: {0}")]
    CaGenerateFailed(String),

    #[error("io error: {0}")]
    Io(String),
}

impl CoreError {
    /// Stable wire code, e.g. `"INVALID_TARGET"`.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::MissingTarget => "MISSING_TARGET",
            CoreError::InvalidTarget(_) => "INVALID_TARGET",
            CoreError::UpstreamError(_) => "UPSTREAM_ERROR",
            CoreError::SessionCreateFailed(_) => "SESSION_CREATE_FAILED",
            CoreError::SessionsListFailed(_) => "SESSIONS_LIST_FAILED",
            CoreError::SessionGetFailed(_) => "SESSION_GET_FAILED",
            CoreError::FramesListFailed(_) => "FRAMES_LIST_FAILED",
            CoreError::EventsListFailed(_) => "EVENTS_LIST_FAILED",
            CoreError::HttpListFailed(_) => "HTTP_LIST_FAILED",
            CoreError::NotFound => "NOT_FOUND",
            CoreError::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            CoreError::BadJson(_) => "BAD_JSON",
            CoreError::BadValue(_) => "BAD_VALUE",
            CoreError::BadAction(_) => "BAD_ACTION",
            CoreError::HijackNotSupported => "HIJACK_NOT_SUPPORTED",
            CoreError::StreamUnsupported => "STREAM_UNSUPPORTED",
            CoreError::LiveUnavailable => "LIVE_UNAVAILABLE",
            CoreError::SendFailed(_) => "SEND_FAILED",
            CoreError::CaptureUnavailable => "CAPTURE_UNAVAILABLE",
            CoreError::CaGenerateFailed(_) => "CA_GENERATE_FAILED",
            CoreError::Io(_) => "IO_ERROR",
        }
    }

    /// HTTP status this error should render as.
    pub fn status(&self) -> u16 {
        match self {
            CoreError::MissingTarget
            | CoreError::InvalidTarget(_)
            | CoreError::BadJson(_)
            | CoreError::BadValue(_)
            | CoreError::BadAction(_) => 400,
            CoreError::NotFound => 404,
            CoreError::MethodNotAllowed => 405,
            CoreError::UpstreamError(_) => 502,
            CoreError::LiveUnavailable | CoreError::CaptureUnavailable => 503,
            _ => 500,
        }
    }

    /// Renders the `{error:{code,message,details}}` envelope.
    pub fn to_envelope(&self, details: Option<Value>) -> Value {
        serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
                "details": details,
            }
        })
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::BadJson(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Classifies a raw error message into the short codes consumed by dashboards.
///
/// Mirrors the original proxy's network-error classifier: a handful of
/// substring checks over the lowercased error text, evaluated in order.
pub fn classify_network_error(raw: &str) -> &'static str {
    let lower = raw.to_lowercase();
    if lower.contains("timeout") || lower.contains("deadline") {
        "TIMEOUT"
    } else if lower.contains("no such host") || lower.contains("server misbehaving") {
        "DNS"
    } else if lower.contains("x509") || lower.contains("certificate") || lower.contains("tls") {
        "TLS"
    } else if lower.contains("connection refused") || lower.contains("cannot assign") {
        "CONNECT"
    } else if lower.contains("reset by peer") || lower.contains("connection reset") {
        "RST"
    } else if lower.contains("eof") || lower.contains("before full header") {
        "EOF"
    } else if lower.contains("request canceled") || lower.contains("client canceled") {
        "CANCEL"
    } else {
        "ERROR"
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
    pub raw: String,
    pub target: String,
    pub method: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_timeout() {
        assert_eq!(classify_network_error("dial tcp: i/o timeout"), "TIMEOUT");
    }

    #[test]
    fn classifies_dns() {
        assert_eq!(
            classify_network_error("lookup foo: no such host"),
            "DNS"
        );
    }

    #[test]
    fn classifies_reset() {
        assert_eq!(
            classify_network_error("read: connection reset by peer"),
            "RST"
        );
    }

    #[test]
    fn falls_back_to_error() {
        assert_eq!(classify_network_error("something weird happened"), "ERROR");
    }

    #[test]
    fn envelope_shape() {
        let err = CoreError::InvalidTarget("ftp://x".into());
        let env = err.to_envelope(Some(serde_json::json!({"target": "ftp://x"})));
        assert_eq!(env["error"]["code"], "INVALID_TARGET");
        assert_eq!(env["error"]["details"]["target"], "ftp://x");
    }
}
