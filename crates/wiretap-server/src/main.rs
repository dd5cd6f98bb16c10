//! Wiretap — intercepting debugging proxy for WebSocket and HTTP traffic.
//!
//! Bootstraps configuration from the environment, wires the shared state
//! (store, monitor hub, live-injection registry, metrics, optional MITM CA)
//! and starts the plain listener (forward proxy + control plane) plus, when
//! `TLS_CERT_FILE`/`TLS_KEY_FILE` are set, a TLS listener carrying only the
//! control plane and reverse proxies (SPEC_FULL.md §6).

mod api;
mod capture;
mod forward_proxy;
mod http_reverse;
mod router;
mod state;
mod tls;
mod ws_proxy;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use wiretap_core::{CertAuthority, Config, DomainFilter, LiveSessions, MonitorHub, Store};

use crate::state::{AppState, Metrics, Mitm};

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// `ADDR`-style values from the original config (`:9091`) bind on all
/// interfaces; anything already host-qualified passes through unchanged.
fn resolve_bind_addr(addr: &str) -> Result<SocketAddr, String> {
    let addr = if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    };
    addr.parse().map_err(|e| format!("invalid bind address {addr:?}: {e}"))
}

fn build_mitm(config: &Config) -> Option<Mitm> {
    if !config.mitm_enable {
        return None;
    }
    let ca = match (&config.mitm_ca_cert_file, &config.mitm_ca_key_file) {
        (Some(cert), Some(key)) => match CertAuthority::load_from_files(cert, key) {
            Ok(ca) => ca,
            Err(e) => {
                tracing::error!(error = %e, "failed to load MITM CA from MITM_CA_CERT_FILE/MITM_CA_KEY_FILE, MITM disabled");
                return None;
            }
        },
        _ if config.dev_mode => match CertAuthority::generate_dev_ca("wiretap dev CA", 0) {
            Ok((cert_pem, key_pem)) => match CertAuthority::load_from_pem(cert_pem.as_bytes(), key_pem.as_bytes()) {
                Ok(ca) => {
                    tracing::warn!("MITM_ENABLE is set with no CA files configured; generated an ephemeral dev CA (DEV_MODE=1)");
                    ca
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to load freshly generated dev CA, MITM disabled");
                    return None;
                }
            },
            Err(e) => {
                tracing::error!(error = %e, "failed to generate dev CA, MITM disabled");
                return None;
            }
        },
        _ => {
            tracing::error!(
                "MITM_ENABLE is set but MITM_CA_CERT_FILE/MITM_CA_KEY_FILE are missing and DEV_MODE is off; MITM disabled"
            );
            return None;
        }
    };
    let filter = DomainFilter {
        allow_suffix: config.mitm_allow_suffixes.clone(),
        deny_suffix: config.mitm_deny_suffixes.clone(),
    };
    Some(Mitm { ca, filter })
}

fn build_http_client(config: &Config) -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(config.insecure_tls)
        .build()
        .expect("reqwest client builds with a static, valid config")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() {
    let config = Arc::new(Config::from_env());
    init_tracing(&config.log_level);

    tracing::info!(addr = %config.addr, tls_addr = ?config.tls_addr, "starting wiretap proxy");

    let store = Arc::new(Store::new(config.max_sessions, config.max_frames_per_session, Some(config.session_ttl())));
    let monitor = Arc::new(MonitorHub::new());
    let live = Arc::new(LiveSessions::new());
    let metrics = Arc::new(Metrics::new());
    let http_client = build_http_client(&config);
    let mitm = build_mitm(&config).map(Arc::new);

    let state = AppState::new(config.clone(), store, monitor, live, metrics, mitm, http_client);

    let plain_addr = match resolve_bind_addr(&config.addr) {
        Ok(a) => a,
        Err(e) => {
            tracing::error!(error = %e, "cannot start: bad ADDR");
            std::process::exit(1);
        }
    };
    let plain_router = router::build_router(state.clone(), true);
    let plain_listener = match tokio::net::TcpListener::bind(plain_addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, addr = %plain_addr, "failed to bind plain listener");
            std::process::exit(1);
        }
    };

    let grace = config.shutdown_grace();
    let grace_secs = config.shutdown_grace_secs;
    let plain_server = async move {
        let serve = axum::serve(
            plain_listener,
            plain_router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal());
        tokio::pin!(serve);
        tokio::select! {
            res = &mut serve => {
                if let Err(e) = res {
                    tracing::error!(error = %e, "plain listener exited with error");
                }
            }
            _ = async { shutdown_signal().await; tokio::time::sleep(grace).await; } => {
                tracing::warn!(grace_secs, "grace period elapsed, forcing remaining connections closed");
            }
        }
    };

    let tls_server = build_tls_server(&config, state.clone());

    match tls_server {
        Some(tls_fut) => {
            tokio::join!(plain_server, tls_fut);
        }
        None => plain_server.await,
    }

    tracing::info!("wiretap proxy stopped");
}

/// Builds the TLS (REST/reverse-proxy only, no forward proxy) listener future
/// when `TLS_CERT_FILE`/`TLS_KEY_FILE` are both configured. `axum_server`
/// carries its own graceful-shutdown handle since it predates `axum::serve`.
fn build_tls_server(config: &Config, state: AppState) -> Option<impl std::future::Future<Output = ()>> {
    let (cert_file, key_file) = match (&config.tls_cert_file, &config.tls_key_file) {
        (Some(c), Some(k)) => (c.clone(), k.clone()),
        _ => return None,
    };
    let addr = match config.tls_addr.as_deref().map(resolve_bind_addr) {
        Some(Ok(a)) => a,
        Some(Err(e)) => {
            tracing::error!(error = %e, "cannot start TLS listener: bad TLS_ADDR");
            return None;
        }
        None => match resolve_bind_addr(":9443") {
            Ok(a) => a,
            Err(_) => return None,
        },
    };
    let grace = config.shutdown_grace();

    Some(async move {
        let tls_config = match axum_server::tls_rustls::RustlsConfig::from_pem_file(&cert_file, &key_file).await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, cert = %cert_file, key = %key_file, "failed to load TLS_CERT_FILE/TLS_KEY_FILE, TLS listener disabled");
                return;
            }
        };
        let router = router::build_router(state, false);
        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown_handle.graceful_shutdown(Some(grace));
        });
        tracing::info!(%addr, "TLS listener starting");
        if let Err(e) = axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(router.into_make_service_with_connect_info::<SocketAddr>())
            .await
        {
            tracing::error!(error = %e, "TLS listener exited with error");
        }
    })
}
