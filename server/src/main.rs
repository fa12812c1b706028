//! Roost control plane entry point.
//!
//! Initialises tracing, loads configuration from `ROOST_*` environment
//! variables, opens the state store, selects the capability backend vendor,
//! and serves the HTTP API.

use std::sync::Arc;

use anyhow::{Context, Result};
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

use roost_server::api::{self, AppState};
use roost_server::application::services::{
    CredentialScopingService, CredentialService, Orchestrator,
};
use roost_server::config::ServerConfig;
use roost_server::infra::backends::Backends;
use roost_server::infra::crypto::SecretSealer;
use roost_server::infra::store::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env()
        .context("failed to load config from ROOST_* env vars (ROOST_SEALING_KEY is required)")?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        database_path = %config.database_path,
        backend = ?config.backend,
        "roostd starting"
    );

    let sealer = SecretSealer::new(SecretString::from(config.sealing_key.clone()))
        .context("invalid ROOST_SEALING_KEY")?;
    let backends = Backends::build(config.backend, sealer);

    let store = SqliteStore::open(std::path::Path::new(&config.database_path))
        .context("failed to open state store")?;

    let scoping = CredentialScopingService::new(
        backends.objects.clone(),
        backends.secrets.clone(),
        config.scoped_ttl(),
    );
    let orchestrator = Arc::new(Orchestrator::new(
        backends.compute.clone(),
        backends.objects.clone(),
        scoping.clone(),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        config.orchestrator_settings(),
    ));
    let credential_service = CredentialService::new(Arc::new(store.clone()), scoping);

    let state = AppState {
        orchestrator,
        agents: Arc::new(store.clone()),
        templates: Arc::new(store.clone()),
        credentials: Arc::new(store.clone()),
        audit: Arc::new(store.clone()),
        identity: backends.identity.clone(),
        compute: backends.compute.clone(),
        credential_service,
    };
    let router = api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!("listening on {}", config.listen_addr);
    axum::serve(listener, router)
        .await
        .context("server exited")?;
    Ok(())
}
