//! Environment-driven runtime configuration.
//!
//! Ported from the original proxy's `config.FromEnv()`: every field has a
//! documented default and is read via plain `env::var`, never a config-file
//! parser, keeping deployment to "set some env vars and run the binary".

use std::env;
use std::time::Duration;

fn get_env(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_env_int(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

fn get_env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => !(v == "0" || v.eq_ignore_ascii_case("false")),
        Err(_) => default,
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: String,
    pub log_level: String,
    pub dev_mode: bool,
    pub cors_allow_origin: String,
    pub default_target: Option<String>,

    pub preview_max_bytes: i64,
    pub preview_decompress: bool,
    pub expose_sensitive_headers: bool,

    pub sse_poll_interval_ms: i64,

    pub tls_addr: Option<String>,
    pub tls_cert_file: Option<String>,
    pub tls_key_file: Option<String>,

    pub capture_bodies: bool,
    pub body_max_bytes: i64,
    pub body_spool_dir: Option<String>,

    /// Parsed from `RESPONSE_DELAY_MS`, which accepts either a bare integer
    /// or a `min-max` range.
    pub response_delay: ResponseDelay,

    pub insecure_tls: bool,

    pub mitm_enable: bool,
    /// Gates the `/mitm/generate` admin endpoint, which returns a freshly
    /// minted CA private key over the control-plane API. Off by default:
    /// this endpoint exists for local dev convenience only.
    pub mitm_allow_ca_generate: bool,
    pub mitm_ca_cert_file: Option<String>,
    pub mitm_ca_key_file: Option<String>,
    pub mitm_allow_suffixes: Vec<String>,
    pub mitm_deny_suffixes: Vec<String>,

    pub max_sessions: usize,
    pub max_frames_per_session: usize,
    pub session_ttl_secs: u64,

    pub shutdown_grace_secs: u64,
}

/// Parses `RESPONSE_DELAY_MS` in either form: a bare non-negative integer, or
/// a `min-max` range (swapped if given reversed). Anything unparsable is
/// treated as "no delay", matching the original's permissive env parsing.
/// Parses the `RESPONSE_DELAY_MS` grammar from an arbitrary string. Exposed
/// so the control-plane `/_api/v1/settings` endpoint can reuse it for
/// runtime reconfiguration instead of re-implementing the grammar.
pub fn parse_response_delay(raw: &str) -> ResponseDelay {
    let raw = raw.trim();
    if raw.is_empty() {
        return ResponseDelay::None;
    }
    if let Some((a, b)) = raw.split_once('-') {
        if let (Ok(min), Ok(max)) = (a.trim().parse::<i64>(), b.trim().parse::<i64>()) {
            let (min, max) = if min > max { (max, min) } else { (min, max) };
            return if min <= 0 && max <= 0 {
                ResponseDelay::None
            } else {
                ResponseDelay::Range(min, max)
            };
        }
        return ResponseDelay::None;
    }
    match raw.parse::<i64>() {
        Ok(ms) if ms > 0 => ResponseDelay::Fixed(ms),
        _ => ResponseDelay::None,
    }
}

impl Config {
    pub fn from_env() -> Self {
        let default_target = env::var("DEFAULT_TARGET").ok().filter(|s| !s.is_empty());
        let tls_addr = env::var("TLS_ADDR").ok().filter(|s| !s.is_empty());
        let tls_cert_file = env::var("TLS_CERT_FILE").ok().filter(|s| !s.is_empty());
        let tls_key_file = env::var("TLS_KEY_FILE").ok().filter(|s| !s.is_empty());
        let body_spool_dir = env::var("BODY_SPOOL_DIR").ok().filter(|s| !s.is_empty());
        let mitm_ca_cert_file = env::var("MITM_CA_CERT_FILE").ok().filter(|s| !s.is_empty());
        let mitm_ca_key_file = env::var("MITM_CA_KEY_FILE").ok().filter(|s| !s.is_empty());

        let mitm_allow_suffixes = split_csv(&get_env("MITM_DOMAINS_ALLOW", ""));
        let mitm_deny_suffixes = split_csv(&get_env("MITM_DOMAINS_DENY", ""));

        Self {
            addr: get_env("ADDR", ":9091"),
            log_level: get_env("LOG_LEVEL", "info"),
            dev_mode: get_env_bool("DEV_MODE", false),
            cors_allow_origin: get_env("CORS_ALLOW_ORIGIN", "*"),
            default_target,

            preview_max_bytes: get_env_int("PREVIEW_MAX_BYTES", 4096),
            preview_decompress: get_env_bool("PREVIEW_DECOMPRESS", true),
            expose_sensitive_headers: get_env_bool("EXPOSE_SENSITIVE_HEADERS", true),

            sse_poll_interval_ms: get_env_int("SSE_POLL_INTERVAL_MS", 500),

            tls_addr,
            tls_cert_file,
            tls_key_file,

            capture_bodies: get_env_bool("CAPTURE_BODIES", false),
            body_max_bytes: get_env_int("BODY_MAX_BYTES", 8 * 1024 * 1024),
            body_spool_dir,

            response_delay: parse_response_delay(&get_env("RESPONSE_DELAY_MS", "")),

            insecure_tls: get_env_bool("INSECURE_TLS", false),

            mitm_enable: get_env_bool("MITM_ENABLE", false),
            mitm_allow_ca_generate: get_env_bool("MITM_ALLOW_CA_GENERATE", false),
            mitm_ca_cert_file,
            mitm_ca_key_file,
            mitm_allow_suffixes,
            mitm_deny_suffixes,

            max_sessions: get_env_int("MAX_SESSIONS", 1000).max(1) as usize,
            max_frames_per_session: get_env_int("MAX_FRAMES_PER_SESSION", 2000).max(1) as usize,
            session_ttl_secs: get_env_int("SESSION_TTL_SECS", 3600).max(0) as u64,

            shutdown_grace_secs: get_env_int("SHUTDOWN_GRACE_SECS", 10).max(0) as u64,
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// The effective fixed/ranged response delay, settable at runtime via
    /// `/_api/v1/settings` (see `state::AppState::response_delay`).
    pub fn response_delay(&self) -> ResponseDelay {
        self.response_delay
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDelay {
    None,
    Fixed(i64),
    Range(i64, i64),
}

fn split_csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serializes tests that mutate process env, since Rust tests run
    // threaded by default and env::var is process-global state.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_without_env() {
        let _g = ENV_LOCK.lock().unwrap();
        for k in ["ADDR", "PREVIEW_MAX_BYTES", "MITM_ALLOW_CA_GENERATE"] {
            env::remove_var(k);
        }
        let cfg = Config::from_env();
        assert_eq!(cfg.addr, ":9091");
        assert_eq!(cfg.preview_max_bytes, 4096);
        assert!(!cfg.mitm_allow_ca_generate);
    }

    #[test]
    fn bool_env_accepts_zero_and_false() {
        let _g = ENV_LOCK.lock().unwrap();
        env::set_var("PREVIEW_DECOMPRESS", "0");
        let cfg = Config::from_env();
        assert!(!cfg.preview_decompress);
        env::remove_var("PREVIEW_DECOMPRESS");
    }

    #[test]
    fn response_delay_parses_bare_integer() {
        let _g = ENV_LOCK.lock().unwrap();
        env::set_var("RESPONSE_DELAY_MS", "100");
        let cfg = Config::from_env();
        assert_eq!(cfg.response_delay(), ResponseDelay::Fixed(100));
        env::remove_var("RESPONSE_DELAY_MS");
    }

    #[test]
    fn response_delay_parses_range_and_swaps_reversed_bounds() {
        let _g = ENV_LOCK.lock().unwrap();
        env::set_var("RESPONSE_DELAY_MS", "100-10");
        let cfg = Config::from_env();
        assert_eq!(cfg.response_delay(), ResponseDelay::Range(10, 100));
        env::remove_var("RESPONSE_DELAY_MS");
    }

    #[test]
    fn csv_suffix_list_trims_and_drops_empty() {
        let _g = ENV_LOCK.lock().unwrap();
        env::set_var("MITM_DOMAINS_ALLOW", "a.com, b.com,, c.com");
        let cfg = Config::from_env();
        assert_eq!(cfg.mitm_allow_suffixes, vec!["a.com", "b.com", "c.com"]);
        env::remove_var("MITM_DOMAINS_ALLOW");
    }
}
