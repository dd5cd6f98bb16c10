use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A decoded Socket.IO packet (or synthetic probe) derived from a text frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub ts: DateTime<Utc>,
    pub namespace: String,
    /// Event name. Serialized under both `event` and `name` at the REST
    /// layer for backward compatibility; the domain type itself only needs
    /// one field.
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<i64>,
    pub args_preview: String,
    pub frame_ids: Vec<String>,
}

impl Event {
    pub fn new(
        namespace: String,
        name: String,
        ack_id: Option<i64>,
        args_preview: String,
        frame_ids: Vec<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ts: Utc::now(),
            namespace,
            name,
            ack_id,
            args_preview,
            frame_ids,
        }
    }
}
