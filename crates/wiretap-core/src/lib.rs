//! Core library for the wiretap debugging proxy.
//!
//! Pure, transport-independent building blocks shared by the `wiretap`
//! binary: the session/frame/event data model, the bounded in-memory store,
//! redaction and preview rendering, the Socket.IO decoder, the MITM
//! certificate authority, the monitor fan-out hub, the live-injection
//! registry, and environment-driven configuration.
//!
//! # Modules
//!
//! - [`domain`] - session/frame/event/HTTP-transaction types
//! - [`store`] - bounded in-memory session store with cursor pagination
//! - [`redact`] - JSON body redaction
//! - [`preview`] - bounded preview rendering for frames and bodies
//! - [`socketio`] - best-effort Socket.IO v3/v4 packet decoder
//! - [`ca`] - MITM certificate authority (load/generate/issue)
//! - [`monitor`] - WS/SSE fan-out hub for live updates
//! - [`live`] - live frame-injection registry
//! - [`config`] - environment-driven runtime configuration
//! - [`error`] - shared error type and wire envelope

pub mod ca;
pub mod config;
pub mod domain;
pub mod error;
pub mod live;
pub mod monitor;
pub mod preview;
pub mod redact;
pub mod socketio;
pub mod store;

pub use ca::{CertAuthority, DomainFilter, IssuedCert};
pub use config::{Config, ResponseDelay};
pub use domain::{
    Direction, Event, EventCounters, Frame, FrameCounters, HttpTimings, HttpTransaction, Opcode,
    Session, SessionKind,
};
pub use error::{classify_network_error, CoreError, Result};
pub use live::LiveSessions;
pub use monitor::{MonitorEvent, MonitorEventType, MonitorHub, SharedMonitorHub};
pub use store::{CaptureFilter, SessionFilter, Store};
