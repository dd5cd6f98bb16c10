//! JSON body redaction: recursively masks values under sensitive key names.

use serde_json::Value;

const SENSITIVE_KEYS: &[&str] = &[
    "authorization",
    "cookie",
    "access_token",
    "id_token",
    "session",
    "apikey",
];

/// Redacts sensitive fields in a JSON string. If `s` does not parse as JSON,
/// it is returned unchanged (non-JSON bodies are never redacted).
pub fn redact_json(s: &str) -> String {
    match serde_json::from_str::<Value>(s) {
        Ok(mut v) => {
            redact_value(&mut v);
            serde_json::to_string(&v).unwrap_or_else(|_| s.to_string())
        }
        Err(_) => s.to_string(),
    }
}

fn redact_value(v: &mut Value) {
    match v {
        Value::Object(map) => {
            for (k, val) in map.iter_mut() {
                if SENSITIVE_KEYS.contains(&k.to_lowercase().as_str()) {
                    *val = Value::String("***".to_string());
                } else {
                    redact_value(val);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                redact_value(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_top_level_key() {
        let out = redact_json(r#"{"access_token":"secret1","i":1}"#);
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["access_token"], "***");
        assert_eq!(v["i"], 1);
    }

    #[test]
    fn redacts_nested_key_case_insensitively() {
        let out = redact_json(r#"{"auth":{"Authorization":"Bearer x"}}"#);
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["auth"]["Authorization"], "***");
    }

    #[test]
    fn leaves_non_json_untouched() {
        let out = redact_json("not json at all");
        assert_eq!(out, "not json at all");
    }

    #[test]
    fn leaves_unrelated_keys_untouched() {
        let out = redact_json(r#"{"name":"alice"}"#);
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["name"], "alice");
    }
}
