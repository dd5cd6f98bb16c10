//! Preview construction: bounded, human-readable renderings of frame
//! payloads and HTTP request/response metadata.

use crate::redact::redact_json;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Read;

const SENSITIVE_HEADER_SUBSTRINGS: &[&str] = &[
    "token", "secret", "authorization", "apikey", "api-key",
];

fn is_sensitive_header(key: &str) -> bool {
    let lower = key.to_lowercase();
    lower == "authorization"
        || lower == "cookie"
        || lower == "set-cookie"
        || SENSITIVE_HEADER_SUBSTRINGS.iter().any(|s| lower.contains(s))
}

/// Masks sensitive header values. Returns `(masked, raw)`; `raw` is the
/// unmodified map, to be attached as `headersRaw` only when the caller's
/// `ExposeSensitiveHeaders` config allows it.
pub fn mask_headers(
    headers: &BTreeMap<String, String>,
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let mut masked = BTreeMap::new();
    for (k, v) in headers {
        if is_sensitive_header(k) {
            masked.insert(k.clone(), "***".to_string());
        } else {
            masked.insert(k.clone(), v.clone());
        }
    }
    (masked, headers.clone())
}

/// Renders a hex dump of up to `min(256, max_bytes)` bytes, space-separated
/// uppercase pairs (e.g. `"DE AD BE EF"`).
pub fn format_binary_preview(data: &[u8], max_bytes: i64) -> String {
    let cap = if max_bytes > 0 {
        std::cmp::min(max_bytes as usize, 256)
    } else {
        256
    };
    let n = std::cmp::min(cap, data.len());
    let mut out = String::with_capacity(n * 3);
    for (i, b) in data[..n].iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{:02X}", b));
    }
    out
}

/// Text preview: attempts JSON parse + recompact + redact; falls back to the
/// raw string. `max_bytes <= 0` disables truncation.
pub fn format_text_preview(data: &[u8], max_bytes: i64) -> String {
    let cap = if max_bytes > 0 {
        std::cmp::min(max_bytes as usize, data.len())
    } else {
        data.len()
    };
    let slice = &data[..cap];
    let as_str = String::from_utf8_lossy(slice);

    match serde_json::from_str::<Value>(&as_str) {
        Ok(v) => {
            let compact = serde_json::to_string(&v).unwrap_or_else(|_| as_str.to_string());
            let redacted = redact_json(&compact);
            truncate_str(&redacted, max_bytes)
        }
        Err(_) => truncate_str(&as_str, max_bytes),
    }
}

fn truncate_str(s: &str, max_bytes: i64) -> String {
    if max_bytes <= 0 || s.len() <= max_bytes as usize {
        return s.to_string();
    }
    let mut end = max_bytes as usize;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Best-effort decompression for preview purposes only, bounded to 1 MiB.
/// The raw bytes forwarded to the real client/upstream are never touched.
pub fn decompress_for_preview(data: &[u8], content_encoding: Option<&str>) -> Vec<u8> {
    const CAP: usize = 1 << 20;
    match content_encoding.map(|s| s.to_lowercase()) {
        Some(enc) if enc == "gzip" => {
            let mut decoder = flate2::read::GzDecoder::new(data);
            let mut buf = Vec::new();
            let mut limited = decoder.by_ref().take(CAP as u64);
            match limited.read_to_end(&mut buf) {
                Ok(_) => buf,
                Err(_) => data.to_vec(),
            }
        }
        Some(enc) if enc == "deflate" => {
            let mut decoder = flate2::read::DeflateDecoder::new(data);
            let mut buf = Vec::new();
            let mut limited = decoder.by_ref().take(CAP as u64);
            match limited.read_to_end(&mut buf) {
                Ok(_) => buf,
                Err(_) => data.to_vec(),
            }
        }
        _ => data.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_preview_caps_at_256_pairs() {
        let data = vec![0xABu8; 1000];
        let preview = format_binary_preview(&data, 4096);
        let pairs: Vec<&str> = preview.split(' ').collect();
        assert_eq!(pairs.len(), 256);
        assert_eq!(pairs[0], "AB");
    }

    #[test]
    fn text_preview_redacts_json() {
        let data = br#"{"access_token":"shh","i":1}"#;
        let preview = format_text_preview(data, 4096);
        assert!(preview.contains("\"***\""));
        assert!(!preview.contains("shh"));
    }

    #[test]
    fn text_preview_truncates_raw_text() {
        let data = vec![b'x'; 5000];
        let preview = format_text_preview(&data, 4096);
        assert!(preview.len() <= 4096);
    }

    #[test]
    fn header_masking_hides_authorization() {
        let mut h = BTreeMap::new();
        h.insert("Authorization".to_string(), "Bearer topsecret".to_string());
        h.insert("X-Request-Id".to_string(), "abc".to_string());
        let (masked, raw) = mask_headers(&h);
        assert_eq!(masked["Authorization"], "***");
        assert_eq!(masked["X-Request-Id"], "abc");
        assert_eq!(raw["Authorization"], "Bearer topsecret");
    }
}
