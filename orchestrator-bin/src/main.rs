//! Orchestrator process: config load, store wiring, background session
//! GC, and the operator API server.

use std::sync::Arc;

use orchestrator_runtime::operator_api::AppState;
use orchestrator_runtime::{
    OrchestratorError, SandboxManager, Settings, enrollment::EnrollmentStore,
    netpolicy::NetworkConfigStore, operator_api_router, provider::ProviderClient,
    session::SessionStore, store::state_dir,
};
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
enum BootError {
    #[error(transparent)]
    Runtime(#[from] OrchestratorError),
    #[error("bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },
    #[error("server: {0}")]
    Serve(std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), BootError> {
    setup_log();

    let settings = Settings::from_env()?;
    let dir = state_dir();
    info!(state_dir = %dir.display(), "opening state stores");

    let sessions = Arc::new(SessionStore::open(dir.join("sessions.json"))?);
    let state = AppState {
        enrollment: Arc::new(EnrollmentStore::open(dir.join("totp_secret.json"))?),
        sessions: sessions.clone(),
        network: Arc::new(NetworkConfigStore::open(dir.join("network_config.json"))?),
        manager: Arc::new(SandboxManager::new(
            ProviderClient::new(settings.provider_base.clone(), settings.provider_token.clone()),
            settings.sandbox_spec(),
        )),
        domain: settings.domain.clone(),
    };

    // Expired sessions are also purged lazily on access; this sweep
    // keeps the store small when nobody is logging in.
    let gc_interval = settings.session_gc_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(gc_interval);
        loop {
            interval.tick().await;
            if let Err(err) = sessions.purge_expired() {
                error!(%err, "session GC failed");
            }
        }
    });

    let router = operator_api_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], settings.port));
    info!(%addr, domain = %settings.domain, "starting operator API");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| BootError::Bind { addr, source })?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(BootError::Serve)?;

    info!("orchestrator stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}

fn setup_log() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};
    if tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()
        .is_err()
    {}
}
