//! Best-effort Socket.IO v3/v4 packet decoder.
//!
//! Pure and allocation-light: given the text of one WS frame, attempt to
//! recognise an EVENT/ACK/BINARY_EVENT/BINARY_ACK packet and extract the
//! namespace, event name, ack id and args preview. No I/O, no panics.

/// Result of a successful decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    pub namespace: String,
    pub name: String,
    /// JSON-encoded args array, compact.
    pub args_json: String,
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Parses the `45<n>-[/ns,][ackId][args]` / `46<n>-...` binary-like body
/// (the part after the two leading type digits have already been stripped,
/// still including the `<n>-` attachments-count prefix).
fn parse_binary_like(rest: &str, is_ack: bool) -> Option<DecodedEvent> {
    // Strip the digit-attachments count, then the mandatory '-'.
    let after_digits = rest.trim_start_matches(|c: char| c.is_ascii_digit());
    let rest = after_digits.strip_prefix('-')?;
    parse_body(rest, is_ack)
}

/// Parses the body after the 2-digit type code for plain (non-binary) `42`/`43` packets.
fn parse_plain(rest: &str, is_ack: bool) -> Option<DecodedEvent> {
    parse_body(rest, is_ack)
}

fn parse_body(mut rest: &str, is_ack: bool) -> Option<DecodedEvent> {
    // A lone comma directly after the type code is consumed and ignored.
    if let Some(r) = rest.strip_prefix(',') {
        rest = r;
    }

    let mut namespace = String::new();
    if let Some(r) = rest.strip_prefix('/') {
        let comma = r.find(',')?;
        namespace = format!("/{}", &r[..comma]);
        rest = &r[comma + 1..];
    }

    // Optional ack-id: consume leading digits up to '['.
    let digit_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let ack_digits = &rest[..digit_end];
    rest = &rest[digit_end..];

    if !rest.starts_with('[') {
        return None;
    }

    if is_ack {
        // Ack packets need only a well-formed `[`-prefixed payload; the
        // event name itself is reported as "ack".
        let _: serde_json::Value = serde_json::from_str(rest).ok()?;
        let args_json = compact(rest);
        let _ = is_digits(ack_digits); // ack id is surfaced separately, see extract_ack_id
        return Some(DecodedEvent {
            namespace,
            name: "ack".to_string(),
            args_json,
        });
    }

    let parsed: serde_json::Value = serde_json::from_str(rest).ok()?;
    let arr = parsed.as_array()?;
    let first = arr.first()?.as_str()?;
    if first.is_empty() {
        return None;
    }
    Some(DecodedEvent {
        namespace,
        name: first.to_string(),
        args_json: compact(rest),
    })
}

fn compact(raw: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(v) => serde_json::to_string(&v).unwrap_or_else(|_| raw.to_string()),
        Err(_) => raw.to_string(),
    }
}

/// Attempts to decode one Socket.IO packet from the given text. Returns
/// `None` on any grammar mismatch; the caller treats the frame as an opaque
/// raw text frame in that case.
pub fn parse_event(s: &str) -> Option<DecodedEvent> {
    if s.len() < 2 {
        return None;
    }
    let (prefix, rest) = s.split_at(2);
    match prefix {
        "45" => parse_binary_like(rest, false),
        "46" => parse_binary_like(rest, true),
        "43" => parse_plain(rest, true),
        "42" => parse_plain(rest, false),
        _ => None,
    }
}

/// Extracts the numeric ack id from a raw Socket.IO packet, independent of
/// whether the main grammar parse succeeded. Returns `None` when no ack id
/// is present.
pub fn extract_ack_id(s: &str) -> Option<i64> {
    if s.len() < 2 {
        return None;
    }
    let mut rest = &s[2..];
    if let Some(r) = rest.strip_prefix(',') {
        rest = r;
    }
    if let Some(r) = rest.strip_prefix('/') {
        let comma = r.find(',')?;
        rest = &r[comma + 1..];
    }
    let digit_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let digits = &rest[..digit_end];
    if digits.is_empty() {
        return None;
    }
    if !rest[digit_end..].starts_with('[') {
        return None;
    }
    digits.parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_plain_event_with_namespace_and_ack() {
        let pkt = r#"42/chat,17["message",{"text":"hi"}]"#;
        let ev = parse_event(pkt).expect("should parse");
        assert_eq!(ev.namespace, "/chat");
        assert_eq!(ev.name, "message");
        assert_eq!(extract_ack_id(pkt), Some(17));
    }

    #[test]
    fn decodes_default_namespace_event() {
        let ev = parse_event(r#"42["ping",1]"#).expect("should parse");
        assert_eq!(ev.namespace, "");
        assert_eq!(ev.name, "ping");
    }

    #[test]
    fn decodes_ack() {
        let ev = parse_event(r#"43[1,2,3]"#).expect("should parse");
        assert_eq!(ev.name, "ack");
    }

    #[test]
    fn decodes_binary_event() {
        let ev = parse_event(r#"451-["image",{"_placeholder":true}]"#).expect("should parse");
        assert_eq!(ev.name, "image");
    }

    #[test]
    fn rejects_non_string_first_element() {
        assert!(parse_event(r#"42[1,2]"#).is_none());
    }

    #[test]
    fn rejects_empty_event_name() {
        assert!(parse_event(r#"42[""]"#).is_none());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(parse_event(r#"42[not json"#).is_none());
    }

    #[test]
    fn rejects_unrelated_text() {
        assert!(parse_event("hello world").is_none());
    }

    #[test]
    fn ack_id_without_namespace() {
        assert_eq!(extract_ack_id(r#"435["ok"]"#), Some(5));
    }

    #[test]
    fn no_ack_id_present() {
        assert_eq!(extract_ack_id(r#"42["ping"]"#), None);
    }
}
