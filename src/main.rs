//! Daemon entry point (C12): installs logging, loads configuration,
//! acquires the PID lock, binds the HTTP listener and serves the API
//! until a shutdown signal is handled.

use std::sync::Arc;
use std::time::Duration;

use loadgend::api::{build_router, RunRegistry};
use loadgend::client;
use loadgend::config::Config;
use loadgend::dns_cache::SharedDnsCache;
use loadgend::lockfile::LockFile;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            return 1;
        }
    };

    let lock = match LockFile::acquire(None) {
        Ok(lock) => lock,
        Err(e) => {
            error!(error = %e, "failed to acquire daemon lock");
            return 1;
        }
    };

    let dns_cache = SharedDnsCache::new();
    let client = match client::build_client(&config.client_config(), dns_cache) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "failed to build HTTP client");
            return 2;
        }
    };

    let requested_port = config.listen_port.unwrap_or(loadgend::config::DEFAULT_PORT);
    let (listener, used_fallback) = match TcpListener::bind(("0.0.0.0", requested_port)).await {
        Ok(listener) => (listener, false),
        Err(e) => {
            warn!(port = requested_port, error = %e, "requested port unavailable, picking a free port");
            match TcpListener::bind(("0.0.0.0", 0)).await {
                Ok(listener) => (listener, true),
                Err(e) => {
                    error!(error = %e, "failed to bind any listener");
                    return 2;
                }
            }
        }
    };

    let bound_port = match listener.local_addr() {
        Ok(addr) => addr.port(),
        Err(e) => {
            error!(error = %e, "failed to read bound listener address");
            return 2;
        }
    };
    if used_fallback {
        if let Err(e) = lock.write_discovery(bound_port) {
            error!(error = %e, "failed to write port discovery file");
            return 2;
        }
    }
    info!(port = bound_port, "listening");

    let registry = Arc::new(RunRegistry::new(client, config));
    let app = build_router(registry.clone());

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await;

    // Dropping `lock` here removes the lock and discovery files.
    drop(lock);

    match serve_result {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "server exited with an error");
            2
        }
    }
}

/// Resolves once a shutdown has been requested, either by a clean
/// drain-then-exit on the first SIGINT/SIGTERM, or immediately (forcing the
/// process to terminate without waiting for `axum::serve` to return) on a
/// second signal or after a bounded grace window.
async fn shutdown_signal(registry: Arc<RunRegistry>) {
    wait_for_signal().await;
    info!("shutdown signal received, requesting graceful stop of all runs");
    registry.request_stop_all().await;

    tokio::select! {
        _ = wait_for_signal() => {
            warn!("second shutdown signal received, forcing immediate exit");
            std::process::exit(130);
        }
        _ = tokio::time::sleep(Duration::from_secs(30)) => {
            warn!("graceful shutdown grace window elapsed, forcing exit");
            std::process::exit(130);
        }
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
