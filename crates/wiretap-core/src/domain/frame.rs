use super::opcode::{Direction, Opcode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: String,
    pub ts: DateTime<Utc>,
    pub direction: Direction,
    pub opcode: Opcode,
    pub size: usize,
    pub preview: String,
}

impl Frame {
    pub fn new(direction: Direction, opcode: Opcode, size: usize, preview: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ts: Utc::now(),
            direction,
            opcode,
            size,
            preview,
        }
    }
}
