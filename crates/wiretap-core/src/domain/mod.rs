mod event;
mod frame;
mod http_transaction;
mod opcode;
mod session;

pub use event::Event;
pub use frame::Frame;
pub use http_transaction::{HttpTimings, HttpTransaction};
pub use opcode::{Direction, Opcode};
pub use session::{EventCounters, FrameCounters, Session, SessionKind};
