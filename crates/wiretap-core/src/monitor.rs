//! Fan-out hub for the live monitor feed: every session/frame/event mutation
//! is broadcast to connected WebSocket monitor clients and to any SSE
//! listener channels subscribed for the same stream.
//!
//! Ported from the original proxy's `MonitorHub` (`monitor.go`): a client
//! set behind one lock, a single write mutex serializing broadcasts (so one
//! slow client can't interleave partial writes with another), and a
//! secondary listener-channel registry for the SSE endpoint. The original
//! keys WS clients by connection identity and limits each broadcast write to
//! a 2s deadline; the write-serialization and bounded-channel behavior is
//! what this module preserves, since the transport-level write-deadline
//! itself is applied where the WS sink is actually driven, in the server
//! crate.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Duration;

/// Broadcast deadline applied by callers driving the physical WebSocket
/// write (see `wiretap-server`'s monitor WS handler).
pub const BROADCAST_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// SSE listener channel capacity; sends beyond this are dropped rather than
/// blocking the broadcaster.
pub const LISTENER_CHANNEL_CAPACITY: usize = 256;

/// Wire spelling matches SPEC_FULL.md's event taxonomy exactly; these are
/// not derived via `rename_all` because a couple (`http_tx_added`) don't
/// follow the mechanical snake_case of their Rust variant name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MonitorEventType {
    #[serde(rename = "session_started")]
    SessionStarted,
    #[serde(rename = "session_ended")]
    SessionEnded,
    #[serde(rename = "session_error")]
    SessionError,
    #[serde(rename = "sessions_cleared")]
    SessionsCleared,
    #[serde(rename = "frame_added")]
    FrameAdded,
    #[serde(rename = "event_added")]
    EventAdded,
    #[serde(rename = "sio_probe")]
    SioProbe,
    #[serde(rename = "http_tx_added")]
    HttpTxAdded,
    #[serde(rename = "settings_changed")]
    SettingsChanged,
    #[serde(rename = "capture_changed")]
    CaptureChanged,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorEvent {
    #[serde(rename = "type")]
    pub kind: MonitorEventType,
    pub id: String,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MonitorEvent {
    pub fn new(kind: MonitorEventType, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            reference: None,
            error: None,
        }
    }

    pub fn with_ref(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// One registered WS monitor client: an outbound channel the hub pushes
/// serialized events into. The server crate owns the actual socket and
/// drains this channel into it.
pub struct MonitorClient {
    pub id: u64,
    pub sender: mpsc::Sender<MonitorEvent>,
}

pub struct MonitorHub {
    clients: RwLock<HashMap<u64, mpsc::Sender<MonitorEvent>>>,
    listeners: RwLock<HashMap<u64, mpsc::Sender<MonitorEvent>>>,
    next_id: AtomicU64,
    // Serializes broadcast so concurrent publishers can't interleave sends
    // to the same client in a way that reorders frames across messages.
    write_mu: Mutex<()>,
}

impl Default for MonitorHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorHub {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            write_mu: Mutex::new(()),
        }
    }

    /// Registers a new WS monitor client and returns its id plus the channel
    /// the caller should forward to the socket.
    pub async fn register_client(&self, buffer: usize) -> (u64, mpsc::Receiver<MonitorEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.clients.write().await.insert(id, tx);
        (id, rx)
    }

    pub async fn unregister_client(&self, id: u64) {
        self.clients.write().await.remove(&id);
    }

    /// Subscribes an SSE listener; returns its id and receiver. Capacity is
    /// fixed at `LISTENER_CHANNEL_CAPACITY` to bound memory when a listener
    /// stalls.
    pub async fn subscribe(&self) -> (u64, mpsc::Receiver<MonitorEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(LISTENER_CHANNEL_CAPACITY);
        self.listeners.write().await.insert(id, tx);
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.listeners.write().await.remove(&id);
    }

    /// Publishes `event` to every registered WS client and SSE listener.
    /// Sends are non-blocking and best-effort: a full or closed channel is
    /// silently dropped rather than stalling the broadcaster or other
    /// recipients.
    pub async fn broadcast(&self, event: MonitorEvent) {
        let _guard = self.write_mu.lock().await;

        let clients: Vec<mpsc::Sender<MonitorEvent>> =
            self.clients.read().await.values().cloned().collect();
        for tx in clients {
            let _ = tx.try_send(event.clone());
        }

        let listeners: Vec<mpsc::Sender<MonitorEvent>> =
            self.listeners.read().await.values().cloned().collect();
        for tx in listeners {
            let _ = tx.try_send(event.clone());
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.read().await.len()
    }
}

pub type SharedMonitorHub = Arc<MonitorHub>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_clients_and_listeners() {
        let hub = MonitorHub::new();
        let (client_id, mut client_rx) = hub.register_client(16).await;
        let (listener_id, mut listener_rx) = hub.subscribe().await;

        hub.broadcast(MonitorEvent::new(MonitorEventType::SessionStarted, "s1"))
            .await;

        let got_client = client_rx.recv().await.unwrap();
        let got_listener = listener_rx.recv().await.unwrap();
        assert_eq!(got_client.id, "s1");
        assert_eq!(got_listener.id, "s1");

        hub.unregister_client(client_id).await;
        hub.unsubscribe(listener_id).await;
        assert_eq!(hub.client_count().await, 0);
        assert_eq!(hub.listener_count().await, 0);
    }

    #[tokio::test]
    async fn full_listener_channel_drops_without_blocking() {
        let hub = MonitorHub::new();
        let (_id, mut rx) = hub.subscribe().await;
        // capacity is 256; push well past it and confirm broadcast never stalls.
        for i in 0..300 {
            hub.broadcast(MonitorEvent::new(MonitorEventType::FrameAdded, i.to_string()))
                .await;
        }
        // Drain whatever made it through; this should not hang.
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert!(count <= LISTENER_CHANNEL_CAPACITY);
    }

    #[tokio::test]
    async fn unregistered_client_receives_nothing() {
        let hub = MonitorHub::new();
        let (id, mut rx) = hub.register_client(4).await;
        hub.unregister_client(id).await;
        hub.broadcast(MonitorEvent::new(MonitorEventType::SessionEnded, "s2"))
            .await;
        assert!(rx.try_recv().is_err());
    }
}
