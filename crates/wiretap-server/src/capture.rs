//! HTTP-specific preview schema construction and body spooling.
//!
//! The opcode-level preview primitives (text/binary truncation, header
//! masking, JSON redaction) live in `wiretap_core::preview`/`redact`; this
//! module builds the `http_request`/`http_response` JSON envelopes SPEC_FULL.md
//! §4.5 describes on top of them, and the body-spool writer used when
//! `CAPTURE_BODIES` is on.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::{json, Value};
use wiretap_core::preview::{decompress_for_preview, format_text_preview, mask_headers};
use wiretap_core::Config;

fn headers_to_map(headers: &reqwest::header::HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (k, v) in headers.iter() {
        if let Ok(s) = v.to_str() {
            out.insert(k.as_str().to_string(), s.to_string());
        }
    }
    out
}

fn body_preview_value(body: &[u8], cfg: &Config, content_encoding: Option<&str>) -> Value {
    let decoded = decompress_for_preview(body, content_encoding);
    let preview = format_text_preview(&decoded, cfg.preview_max_bytes);
    match serde_json::from_str::<Value>(&preview) {
        Ok(v) => v,
        Err(_) => Value::String(preview),
    }
}

/// Builds the `{type:"http_request", method, url, headers, headersRaw?, body?}` preview.
pub fn request_preview(
    cfg: &Config,
    method: &str,
    url: &str,
    headers: &reqwest::header::HeaderMap,
    body: &[u8],
) -> Value {
    let raw = headers_to_map(headers);
    let (masked, raw_map) = mask_headers(&raw);
    let mut obj = json!({
        "type": "http_request",
        "method": method,
        "url": url,
        "headers": masked,
    });
    if cfg.expose_sensitive_headers {
        obj["headersRaw"] = json!(raw_map);
    }
    if !body.is_empty() {
        obj["body"] = body_preview_value(body, cfg, None);
    }
    obj
}

#[derive(Debug, Clone, Default)]
pub struct CookieSummary {
    pub set_cookie_count: usize,
    pub secure: bool,
    pub http_only: bool,
    pub same_site_lax: bool,
    pub same_site_strict: bool,
    pub same_site_none: bool,
}

pub fn summarize_cookies(headers: &reqwest::header::HeaderMap) -> Option<CookieSummary> {
    let mut summary = CookieSummary::default();
    for v in headers.get_all(reqwest::header::SET_COOKIE).iter() {
        let Ok(s) = v.to_str() else { continue };
        summary.set_cookie_count += 1;
        let lower = s.to_lowercase();
        if lower.contains("secure") {
            summary.secure = true;
        }
        if lower.contains("httponly") {
            summary.http_only = true;
        }
        if lower.contains("samesite=lax") {
            summary.same_site_lax = true;
        }
        if lower.contains("samesite=strict") {
            summary.same_site_strict = true;
        }
        if lower.contains("samesite=none") {
            summary.same_site_none = true;
        }
    }
    if summary.set_cookie_count == 0 {
        None
    } else {
        Some(summary)
    }
}

/// Builds the `{type:"http_response", status, headers, ..., timings?}` preview.
#[allow(clippy::too_many_arguments)]
pub fn response_preview(
    cfg: &Config,
    status: u16,
    headers: &reqwest::header::HeaderMap,
    body: &[u8],
    ttfb_ms: i64,
    total_ms: i64,
) -> Value {
    let raw = headers_to_map(headers);
    let (masked, raw_map) = mask_headers(&raw);
    let content_encoding = headers
        .get(reqwest::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let mut obj = json!({
        "type": "http_response",
        "status": status,
        "headers": masked,
        "timings": {"ttfbMs": ttfb_ms, "totalMs": total_ms},
    });
    if cfg.expose_sensitive_headers {
        obj["headersRaw"] = json!(raw_map);
    }
    if let Some(summary) = summarize_cookies(headers) {
        obj["cookieSummary"] = json!({
            "setCookieCount": summary.set_cookie_count,
            "secure": summary.secure,
            "httpOnly": summary.http_only,
            "sameSiteLax": summary.same_site_lax,
            "sameSiteStrict": summary.same_site_strict,
            "sameSiteNone": summary.same_site_none,
        });
    }
    if !body.is_empty() {
        obj["body"] = body_preview_value(body, cfg, content_encoding.as_deref());
    }
    obj
}

/// Spools up to `cfg.body_max_bytes` of `data` into a uniquely named temp
/// file under `cfg.body_spool_dir` (or the OS temp dir), returning the path
/// on success. Errors are swallowed by the caller per SPEC_FULL.md §4.5
/// ("on error the field stays empty").
pub fn spool_body(cfg: &Config, data: &[u8], label: &str) -> Option<String> {
    if !cfg.capture_bodies {
        return None;
    }
    let dir: PathBuf = cfg
        .body_spool_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    std::fs::create_dir_all(&dir).ok()?;
    let cap = std::cmp::min(data.len(), cfg.body_max_bytes.max(0) as usize);
    let file_name = format!("wiretap-{}-{}.body", label, uuid::Uuid::new_v4());
    let path = dir.join(file_name);
    std::fs::write(&path, &data[..cap]).ok()?;
    Some(path.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiretap_core::Config;

    fn test_cfg() -> Config {
        let mut cfg = Config::from_env();
        cfg.preview_max_bytes = 4096;
        cfg.expose_sensitive_headers = false;
        cfg
    }

    #[test]
    fn request_preview_masks_authorization() {
        let cfg = test_cfg();
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::AUTHORIZATION,
            "Bearer topsecret".parse().unwrap(),
        );
        let preview = request_preview(&cfg, "GET", "http://x/get", &headers, b"");
        assert_eq!(preview["headers"]["authorization"], "***");
        assert!(preview.get("headersRaw").is_none());
    }

    #[test]
    fn response_preview_masks_set_cookie_and_summarizes() {
        let cfg = test_cfg();
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::SET_COOKIE,
            "sid=supersecret; Secure; HttpOnly".parse().unwrap(),
        );
        let preview = response_preview(&cfg, 200, &headers, b"", 10, 20);
        assert_eq!(preview["headers"]["set-cookie"], "***");
        assert_eq!(preview["cookieSummary"]["setCookieCount"], 1);
        assert_eq!(preview["cookieSummary"]["secure"], true);
    }

    #[test]
    fn spool_disabled_returns_none() {
        let mut cfg = test_cfg();
        cfg.capture_bodies = false;
        assert!(spool_body(&cfg, b"hello", "req").is_none());
    }
}
