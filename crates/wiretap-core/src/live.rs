//! Live-injection registry: lets the control plane push a synthetic frame
//! into an in-flight WebSocket session, in either direction, while the real
//! proxy pump continues to run.
//!
//! Ported from the original proxy's `LiveSessions`/`liveWS` (`live.go`): a
//! map from session id to a pair of outbound handles plus a per-session
//! write lock, so an injected send can't interleave with the pump's own
//! writes on the same socket.

use crate::domain::Direction;
use crate::error::{CoreError, Result};
use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex, RwLock};

/// An injectable outbound text message, handed to whichever task owns the
/// real socket write half.
#[derive(Debug, Clone)]
pub struct InjectedText {
    pub payload: String,
}

struct LiveEntry {
    client_tx: mpsc::Sender<InjectedText>,
    upstream_tx: mpsc::Sender<InjectedText>,
    // Serializes injected sends against each other per session; the pump's
    // own writes are serialized on the socket itself and are not covered by
    // this lock.
    write_mu: Mutex<()>,
}

#[derive(Default)]
pub struct LiveSessions {
    sessions: RwLock<HashMap<String, LiveEntry>>,
}

impl LiveSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a live session's two injection channels. Called once the
    /// WS proxy pump for `session_id` has dialed upstream.
    pub async fn register(
        &self,
        session_id: impl Into<String>,
        client_tx: mpsc::Sender<InjectedText>,
        upstream_tx: mpsc::Sender<InjectedText>,
    ) {
        self.sessions.write().await.insert(
            session_id.into(),
            LiveEntry {
                client_tx,
                upstream_tx,
                write_mu: Mutex::new(()),
            },
        );
    }

    pub async fn unregister(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    pub async fn is_live(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// Sends `payload` into the session's pump in `direction`. Returns
    /// `CoreError::LiveUnavailable` if the session isn't currently live, and
    /// `CoreError::SendFailed` if the pump's receiver has gone away.
    pub async fn send_text(
        &self,
        session_id: &str,
        direction: Direction,
        payload: String,
    ) -> Result<()> {
        let sessions = self.sessions.read().await;
        let entry = sessions
            .get(session_id)
            .ok_or(CoreError::LiveUnavailable)?;

        let _guard = entry.write_mu.lock().await;
        // `client_tx` feeds the pump task that writes to the *client* socket,
        // so an upstream->client injection goes out through it; symmetrically
        // for `upstream_tx` and a client->upstream injection.
        let tx = match direction {
            Direction::ClientToUpstream => &entry.upstream_tx,
            Direction::UpstreamToClient => &entry.client_tx,
        };
        tx.send(InjectedText { payload })
            .await
            .map_err(|e| CoreError::SendFailed(e.to_string()))
    }

    pub async fn live_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_routes_by_direction() {
        let live = LiveSessions::new();
        let (ctx, mut crx) = mpsc::channel(4);
        let (utx, mut urx) = mpsc::channel(4);
        live.register("s1", ctx, utx).await;

        live.send_text("s1", Direction::ClientToUpstream, "to-upstream".into())
            .await
            .unwrap();
        live.send_text("s1", Direction::UpstreamToClient, "to-client".into())
            .await
            .unwrap();

        assert_eq!(urx.recv().await.unwrap().payload, "to-upstream");
        assert_eq!(crx.recv().await.unwrap().payload, "to-client");
    }

    #[tokio::test]
    async fn send_to_unregistered_session_fails() {
        let live = LiveSessions::new();
        let err = live
            .send_text("missing", Direction::ClientToUpstream, "x".into())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "LIVE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn unregister_removes_session() {
        let live = LiveSessions::new();
        let (ctx, _crx) = mpsc::channel(4);
        let (utx, _urx) = mpsc::channel(4);
        live.register("s2", ctx, utx).await;
        assert!(live.is_live("s2").await);
        live.unregister("s2").await;
        assert!(!live.is_live("s2").await);
    }
}
