use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrameCounters {
    pub total: u64,
    pub text: u64,
    pub binary: u64,
    pub control: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventCounters {
    pub total: u64,
    pub sio: u64,
    pub raw: u64,
}

/// A session's kind. CONNECT-tunnel and absolute-URI forward-proxy sessions
/// are classified as `Http` even though no reverse-proxy request/response
/// pair necessarily exists on them (see SPEC_FULL.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Ws,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub target: String,
    pub client_addr: String,
    pub started_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub frames: FrameCounters,
    pub events: EventCounters,
    pub evicted: bool,
    pub kind: SessionKind,
    pub capture_id: Option<i64>,
}

impl Session {
    pub fn new(id: String, target: String, client_addr: String, kind: SessionKind) -> Self {
        Self {
            id,
            target,
            client_addr,
            started_at: Utc::now(),
            closed_at: None,
            error: None,
            frames: FrameCounters::default(),
            events: EventCounters::default(),
            evicted: false,
            kind,
            capture_id: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }
}
