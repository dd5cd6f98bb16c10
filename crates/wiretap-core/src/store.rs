//! Bounded, thread-safe in-memory session store.
//!
//! Ported from the original proxy's `internal/adapters/storage/memory` store.
//! Persistence across restarts is an explicit non-goal (see SPEC_FULL.md §1),
//! so unlike the teacher's sled-backed storage, this store never touches
//! disk — it lives entirely behind a `tokio::sync::RwLock`.

use crate::domain::{Direction, Event, Frame, FrameCounters, HttpTransaction, Opcode, Session, SessionKind};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

struct SessionEntry {
    session: Session,
    frames: Vec<Frame>,
    events: Vec<Event>,
    http_txs: Vec<HttpTransaction>,
    created_at: Instant,
}

struct Inner {
    order: Vec<String>,
    items: HashMap<String, SessionEntry>,
    current_capture: i64,
    recording: bool,
}

/// "current" vs. a concrete capture group id, as accepted by `ListSessions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFilter {
    Current,
    Exact(i64),
}

#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub q: String,
    pub target: String,
    pub capture_id: Option<CaptureFilter>,
    pub include_unassigned: bool,
    pub limit: usize,
    pub offset: usize,
}

pub struct Store {
    inner: RwLock<Inner>,
    max_sessions: usize,
    max_frames_per_session: usize,
    ttl: Option<Duration>,
}

fn paginate<T: Clone>(items: &[T], from: &str, limit: usize, id_of: impl Fn(&T) -> &str) -> (Vec<T>, String) {
    let start = if from.is_empty() {
        0
    } else {
        items
            .iter()
            .position(|it| id_of(it) == from)
            .map(|i| i + 1)
            .unwrap_or(0)
    };
    if start >= items.len() {
        return (Vec::new(), String::new());
    }
    let limit = if limit == 0 { items.len() - start } else { limit };
    let end = std::cmp::min(start + limit, items.len());
    let page = items[start..end].to_vec();
    let next = if end < items.len() {
        id_of(&items[end - 1]).to_string()
    } else {
        String::new()
    };
    (page, next)
}

impl Store {
    pub fn new(max_sessions: usize, max_frames_per_session: usize, ttl: Option<Duration>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                order: Vec::new(),
                items: HashMap::new(),
                current_capture: 0,
                recording: true,
            }),
            max_sessions,
            max_frames_per_session,
            ttl,
        }
    }

    pub async fn recording_state(&self) -> (bool, i64) {
        let inner = self.inner.read().await;
        (inner.recording, inner.current_capture)
    }

    pub async fn start_capture(&self) -> i64 {
        let mut inner = self.inner.write().await;
        inner.current_capture += 1;
        inner.recording = true;
        inner.current_capture
    }

    pub async fn stop_capture(&self) -> i64 {
        let mut inner = self.inner.write().await;
        inner.recording = false;
        inner.current_capture
    }

    fn evict_expired_locked(&self, inner: &mut Inner) {
        let Some(ttl) = self.ttl else { return };
        let now = Instant::now();
        let expired: Vec<String> = inner
            .order
            .iter()
            .filter(|id| {
                inner
                    .items
                    .get(*id)
                    .map(|e| now.duration_since(e.created_at) > ttl)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for id in expired {
            inner.items.remove(&id);
            inner.order.retain(|x| x != &id);
        }
    }

    /// Creates a session, recording it under the current capture group iff
    /// recording is on. Evicts expired entries, then the oldest if at
    /// capacity.
    pub async fn create_session(&self, mut session: Session) -> Session {
        let mut inner = self.inner.write().await;
        self.evict_expired_locked(&mut inner);
        if inner.items.len() >= self.max_sessions && !inner.order.is_empty() {
            let oldest = inner.order.remove(0);
            inner.items.remove(&oldest);
        }
        if inner.recording {
            session.capture_id = Some(inner.current_capture);
        }
        let id = session.id.clone();
        inner.order.push(id.clone());
        inner.items.insert(
            id,
            SessionEntry {
                session: session.clone(),
                frames: Vec::new(),
                events: Vec::new(),
                http_txs: Vec::new(),
                created_at: Instant::now(),
            },
        );
        session
    }

    pub async fn get_session(&self, id: &str) -> Option<Session> {
        let inner = self.inner.read().await;
        inner.items.get(id).map(|e| e.session.clone())
    }

    pub async fn delete_session(&self, id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let existed = inner.items.remove(id).is_some();
        inner.order.retain(|x| x != id);
        existed
    }

    pub async fn clear_all_sessions(&self) {
        let mut inner = self.inner.write().await;
        inner.items = HashMap::new();
        inner.order = Vec::new();
        // current_capture is intentionally preserved.
    }

    pub async fn list_sessions(&self, filter: &SessionFilter) -> (Vec<Session>, usize) {
        let inner = self.inner.read().await;
        let q = filter.q.to_lowercase();
        let target = filter.target.to_lowercase();

        let mut matched: Vec<Session> = Vec::new();
        for id in &inner.order {
            let Some(entry) = inner.items.get(id) else { continue };
            let sess = &entry.session;

            match filter.capture_id {
                Some(CaptureFilter::Current) => {
                    if sess.capture_id != Some(inner.current_capture) {
                        continue;
                    }
                }
                Some(CaptureFilter::Exact(n)) => {
                    if sess.capture_id != Some(n) {
                        continue;
                    }
                }
                None => {
                    if sess.capture_id.is_none() && !filter.include_unassigned {
                        continue;
                    }
                }
            }

            if !target.is_empty() && !sess.target.to_lowercase().contains(&target) {
                continue;
            }
            if !q.is_empty() && !sess.target.to_lowercase().contains(&q) {
                continue;
            }
            matched.push(sess.clone());
        }

        let total = matched.len();
        let offset = std::cmp::min(filter.offset, matched.len());
        let end = if filter.limit == 0 {
            matched.len()
        } else {
            std::cmp::min(offset + filter.limit, matched.len())
        };
        (matched[offset..end].to_vec(), total)
    }

    pub async fn set_closed(&self, id: &str, error: Option<String>) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.items.get_mut(id) {
            entry.session.closed_at = Some(chrono::Utc::now());
            entry.session.error = error;
        }
    }

    /// Appends a frame, applying the drop-from-head ring semantics and
    /// bumping the session's aggregate counters atomically.
    pub async fn append_frame(&self, id: &str, frame: Frame) {
        let mut inner = self.inner.write().await;
        let cap = self.max_frames_per_session;
        if let Some(entry) = inner.items.get_mut(id) {
            if entry.frames.len() >= cap {
                entry.frames.remove(0);
            }
            let counters = &mut entry.session.frames;
            counters.total += 1;
            match frame.opcode {
                Opcode::Text => counters.text += 1,
                Opcode::Binary => counters.binary += 1,
                Opcode::Ping | Opcode::Pong | Opcode::Close => counters.control += 1,
            }
            entry.frames.push(frame);
        }
    }

    /// `is_sio` distinguishes a decoded Socket.IO packet from a synthetic
    /// marker event (currently only `sio_probe`), which counts against
    /// `events.raw` instead of `events.sio`.
    pub async fn append_event(&self, id: &str, event: Event, is_sio: bool) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.items.get_mut(id) {
            entry.session.events.total += 1;
            if is_sio {
                entry.session.events.sio += 1;
            } else {
                entry.session.events.raw += 1;
            }
            entry.events.push(event);
        }
    }

    pub async fn append_http_transaction(&self, tx: HttpTransaction) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.items.get_mut(&tx.session_id) {
            entry.http_txs.push(tx);
        }
    }

    pub async fn list_frames(&self, id: &str, from: &str, limit: usize) -> (Vec<Frame>, String) {
        let inner = self.inner.read().await;
        match inner.items.get(id) {
            Some(entry) => paginate(&entry.frames, from, limit, |f| f.id.as_str()),
            None => (Vec::new(), String::new()),
        }
    }

    pub async fn list_events(&self, id: &str, from: &str, limit: usize) -> (Vec<Event>, String) {
        let inner = self.inner.read().await;
        match inner.items.get(id) {
            Some(entry) => paginate(&entry.events, from, limit, |e| e.id.as_str()),
            None => (Vec::new(), String::new()),
        }
    }

    pub async fn list_http_transactions(
        &self,
        id: &str,
        from: &str,
        limit: usize,
    ) -> (Vec<HttpTransaction>, String) {
        let inner = self.inner.read().await;
        match inner.items.get(id) {
            Some(entry) => paginate(&entry.http_txs, from, limit, |t| t.id.as_str()),
            None => (Vec::new(), String::new()),
        }
    }
}

pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn new_session(target: String, client_addr: String, kind: SessionKind) -> Session {
    Session::new(new_session_id(), target, client_addr, kind)
}

/// Convenience constructor for a WS-reverse-proxy frame, matching the most
/// common call shape in the proxy engine.
pub fn new_frame(direction: Direction, opcode: Opcode, data: &[u8], preview: String) -> Frame {
    Frame::new(direction, opcode, data.len(), preview)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SessionKind;

    fn store() -> Store {
        Store::new(2, 3, None)
    }

    #[tokio::test]
    async fn create_and_get_round_trips() {
        let store = store();
        let s = new_session("ws://x".into(), "127.0.0.1".into(), SessionKind::Ws);
        let created = store.create_session(s.clone()).await;
        let fetched = store.get_session(&created.id).await.unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.capture_id, Some(0));
    }

    #[tokio::test]
    async fn capacity_evicts_oldest() {
        let store = store();
        let s1 = store
            .create_session(new_session("a".into(), "c".into(), SessionKind::Ws))
            .await;
        let _s2 = store
            .create_session(new_session("b".into(), "c".into(), SessionKind::Ws))
            .await;
        let _s3 = store
            .create_session(new_session("c".into(), "c".into(), SessionKind::Ws))
            .await;
        assert!(store.get_session(&s1.id).await.is_none());
    }

    #[tokio::test]
    async fn delete_then_get_is_none_and_second_delete_is_noop() {
        let store = store();
        let s = store
            .create_session(new_session("a".into(), "c".into(), SessionKind::Ws))
            .await;
        assert!(store.delete_session(&s.id).await);
        assert!(store.get_session(&s.id).await.is_none());
        assert!(!store.delete_session(&s.id).await);
    }

    #[tokio::test]
    async fn frame_ring_drops_from_head() {
        let store = store();
        let s = store
            .create_session(new_session("a".into(), "c".into(), SessionKind::Ws))
            .await;
        for i in 0..5 {
            let f = new_frame(
                Direction::ClientToUpstream,
                Opcode::Text,
                b"x",
                format!("f{i}"),
            );
            store.append_frame(&s.id, f).await;
        }
        let (frames, _) = store.list_frames(&s.id, "", 0).await;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].preview, "f2");
        assert_eq!(frames[2].preview, "f4");
        let fetched = store.get_session(&s.id).await.unwrap();
        assert_eq!(fetched.frames.total, 5);
        assert_eq!(fetched.frames.text, 5);
    }

    #[tokio::test]
    async fn pagination_cursor_walks_pages() {
        let store = Store::new(10, 100, None);
        let s = store
            .create_session(new_session("a".into(), "c".into(), SessionKind::Ws))
            .await;
        for i in 0..5 {
            let f = new_frame(
                Direction::ClientToUpstream,
                Opcode::Text,
                b"x",
                format!("f{i}"),
            );
            store.append_frame(&s.id, f).await;
        }
        let (page1, next1) = store.list_frames(&s.id, "", 2).await;
        assert_eq!(page1.len(), 2);
        assert!(!next1.is_empty());
        let (page2, next2) = store.list_frames(&s.id, &next1, 2).await;
        assert_eq!(page2.len(), 2);
        let (page3, next3) = store.list_frames(&s.id, &next2, 2).await;
        assert_eq!(page3.len(), 1);
        assert!(next3.is_empty());
    }

    #[tokio::test]
    async fn stale_cursor_restarts_from_beginning() {
        let store = Store::new(10, 100, None);
        let s = store
            .create_session(new_session("a".into(), "c".into(), SessionKind::Ws))
            .await;
        store
            .append_frame(
                &s.id,
                new_frame(Direction::ClientToUpstream, Opcode::Text, b"x", "f0".into()),
            )
            .await;
        let (page, _) = store.list_frames(&s.id, "does-not-exist", 10).await;
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn clear_all_preserves_capture_counter() {
        let store = Store::new(10, 100, None);
        store.start_capture().await;
        store.start_capture().await;
        let (_, cap_before) = store.recording_state().await;
        store
            .create_session(new_session("a".into(), "c".into(), SessionKind::Ws))
            .await;
        store.clear_all_sessions().await;
        let (_, total) = store.list_sessions(&SessionFilter::default()).await;
        assert_eq!(total, 0);
        let (_, cap_after) = store.recording_state().await;
        assert_eq!(cap_before, cap_after);
    }

    #[tokio::test]
    async fn capture_filter_current_vs_unassigned() {
        let store = Store::new(10, 100, None);
        store.stop_capture().await;
        let unassigned = store
            .create_session(new_session("a".into(), "c".into(), SessionKind::Ws))
            .await;
        store.start_capture().await;
        let assigned = store
            .create_session(new_session("b".into(), "c".into(), SessionKind::Ws))
            .await;

        let (items, _) = store
            .list_sessions(&SessionFilter {
                capture_id: Some(CaptureFilter::Current),
                ..Default::default()
            })
            .await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, assigned.id);

        let (items, _) = store
            .list_sessions(&SessionFilter {
                include_unassigned: true,
                ..Default::default()
            })
            .await;
        assert_eq!(items.len(), 2);
        assert!(items.iter().any(|s| s.id == unassigned.id));
    }
}
