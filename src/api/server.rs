//! HTTP server setup and configuration.

use axum::{
    routing::{get, post},
    Router,
};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::config::Config;
use crate::gateway::Gateway;
use crate::ledger::{MemoryTurnStore, TurnStore};
use crate::provider::OpenAiAdapter;
use crate::registry::{HealthPolicy, ProviderDescriptor, ProviderRegistry};
use crate::storage::{self, SqliteTurnStore};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    pub config: Arc<Config>,
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/v1/conversations/:conversation_id/turns",
            post(handlers::create_turn),
        )
        .route(
            "/v1/conversations/:conversation_id",
            get(handlers::get_conversation).delete(handlers::delete_conversation),
        )
        .route("/v1/turns/:turn_id/stream", get(handlers::resume_stream))
        .route("/v1/turns/:turn_id/cancel", post(handlers::cancel_turn))
        .route("/providers", get(handlers::list_providers))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Build the provider registry, one OpenAI-compatible adapter per
/// configured provider.
pub fn build_registry(config: &Config, http_client: &Client) -> ProviderRegistry {
    let registry = ProviderRegistry::new(
        HealthPolicy::from(&config.health),
        config.health.degraded_ordering,
    );
    for provider in &config.providers {
        registry.register(
            ProviderDescriptor::from(provider),
            Arc::new(OpenAiAdapter::from_config(provider, http_client.clone())),
        );
    }
    registry
}

/// Run the HTTP server.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();

    // No overall timeout: streams may legitimately run for minutes.
    // Per-provider limits come from `timeout_secs`.
    let http_client = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?;

    let registry = Arc::new(build_registry(&config, &http_client));

    let store: Arc<dyn TurnStore> = match &config.database {
        Some(db) => Arc::new(SqliteTurnStore::new(storage::init_pool(&db.path).await?)),
        None => {
            tracing::warn!("No [database] configured, transcripts are kept in memory only");
            Arc::new(MemoryTurnStore::new())
        }
    };

    let gateway = Gateway::from_config(&config.gateway, registry, store);
    let state = AppState {
        gateway,
        config: Arc::new(config),
    };

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "Starting chatrelay gateway");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
