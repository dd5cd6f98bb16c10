use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HttpTimings {
    #[serde(rename = "dnsMs")]
    pub dns_ms: i64,
    #[serde(rename = "connectMs")]
    pub connect_ms: i64,
    #[serde(rename = "tlsMs")]
    pub tls_ms: i64,
    #[serde(rename = "ttfbMs")]
    pub ttfb_ms: i64,
    #[serde(rename = "totalMs")]
    pub total_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTransaction {
    pub id: String,
    pub session_id: String,
    pub method: String,
    pub url: String,
    pub status: u16,
    pub req_size: usize,
    pub resp_size: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub timings: HttpTimings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_body_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resp_body_file: Option<String>,
}
