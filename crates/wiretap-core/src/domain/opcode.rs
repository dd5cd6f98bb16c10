use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire-level frame opcode, independent of transport (WS message kind, or a
/// rendered HTTP request/response pair when used for HTTP frames).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Opcode {
    Text,
    Binary,
    Ping,
    Pong,
    Close,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Opcode::Text => "text",
            Opcode::Binary => "binary",
            Opcode::Ping => "ping",
            Opcode::Pong => "pong",
            Opcode::Close => "close",
        };
        f.write_str(s)
    }
}

/// Direction a frame travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "client->upstream")]
    ClientToUpstream,
    #[serde(rename = "upstream->client")]
    UpstreamToClient,
}
