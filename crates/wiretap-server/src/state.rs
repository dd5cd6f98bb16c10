//! Shared application state threaded through every handler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use wiretap_core::{CertAuthority, Config, DomainFilter, LiveSessions, ResponseDelay, SharedMonitorHub, Store};

/// Process-wide metrics, exposed at `/metrics` in Prometheus text format.
///
/// Grounded on the teacher's own `tracing`-first observability posture,
/// widened with the `prometheus` crate the way SPEC_FULL.md's logging &
/// metrics section calls for: a handful of gauges/counters rather than a
/// hand-rolled exposition writer.
pub struct Metrics {
    pub registry: prometheus::Registry,
    pub active_sessions: prometheus::IntGauge,
    pub frames_total: prometheus::IntCounterVec,
    pub http_tx_total: prometheus::IntCounter,
    pub sio_events_total: prometheus::IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = prometheus::Registry::new();
        let active_sessions = prometheus::IntGauge::new(
            "wiretap_active_sessions",
            "Number of currently open proxy sessions",
        )
        .expect("metric");
        let frames_total = prometheus::IntCounterVec::new(
            prometheus::Opts::new("wiretap_frames_total", "Frames recorded, by direction"),
            &["direction"],
        )
        .expect("metric");
        let http_tx_total = prometheus::IntCounter::new(
            "wiretap_http_transactions_total",
            "HTTP reverse-proxy transactions recorded",
        )
        .expect("metric");
        let sio_events_total = prometheus::IntCounter::new(
            "wiretap_socketio_events_total",
            "Socket.IO packets decoded from text frames",
        )
        .expect("metric");

        registry
            .register(Box::new(active_sessions.clone()))
            .expect("register");
        registry
            .register(Box::new(frames_total.clone()))
            .expect("register");
        registry
            .register(Box::new(http_tx_total.clone()))
            .expect("register");
        registry
            .register(Box::new(sio_events_total.clone()))
            .expect("register");

        Self {
            registry,
            active_sessions,
            frames_total,
            http_tx_total,
            sio_events_total,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// The live MITM certificate authority plus the host allow/deny filter that
/// gates whether a given `CONNECT` target is eligible for interception.
pub struct Mitm {
    pub ca: CertAuthority,
    pub filter: DomainFilter,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub monitor: SharedMonitorHub,
    pub live: Arc<LiveSessions>,
    pub metrics: Arc<Metrics>,
    pub mitm: Arc<tokio::sync::RwLock<Option<Arc<Mitm>>>>,
    pub http_client: reqwest::Client,
    /// Next frame-ordinal used by MITM's synthetic request/response frames,
    /// shared so concurrent MITM connections don't collide on a local
    /// counter. Not part of the domain model; purely a helper for deriving
    /// stable-ish ids where one is needed outside the store.
    pub counter: Arc<AtomicU64>,
    /// Runtime-overridable response delay, settable via `/_api/v1/settings`.
    /// Seeded from `Config::response_delay` at boot but never re-read from
    /// `Config` afterwards.
    pub response_delay: Arc<tokio::sync::RwLock<ResponseDelay>>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        monitor: SharedMonitorHub,
        live: Arc<LiveSessions>,
        metrics: Arc<Metrics>,
        mitm: Option<Arc<Mitm>>,
        http_client: reqwest::Client,
    ) -> Self {
        let response_delay = Arc::new(tokio::sync::RwLock::new(config.response_delay()));
        Self {
            config,
            store,
            monitor,
            live,
            metrics,
            mitm: Arc::new(tokio::sync::RwLock::new(mitm)),
            http_client,
            counter: Arc::new(AtomicU64::new(1)),
            response_delay,
        }
    }

    pub fn next_counter(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn mitm_enabled(&self) -> bool {
        self.mitm.read().await.is_some()
    }

    pub async fn current_response_delay(&self) -> ResponseDelay {
        *self.response_delay.read().await
    }
}
