use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use nitpick_core::vault::Vault;
use nitpick_server::analysis::NullEngine;
use nitpick_server::config::Config;
use nitpick_server::github::GitHubClient;
use nitpick_server::ingress::webhook_router;
use nitpick_server::queue::SqliteQueue;
use nitpick_server::registry::InstallationRegistry;
use nitpick_server::store::SqliteStore;
use nitpick_server::worker::{spawn_workers, WorkerContext};
use nitpick_server::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting nitpick review service");

    let config = Config::from_env()?;

    // Every dependency is constructed here and passed down explicitly; no
    // global clients.
    let vault = Vault::new(config.vault_master_key.clone().into_bytes());

    let store_path = config.state_dir.join("nitpick-state.db");
    info!("Using state database: {}", store_path.display());
    let store = Arc::new(SqliteStore::new(&store_path)?);

    let queue_path = config.state_dir.join("nitpick-queue.db");
    info!("Using queue database: {}", queue_path.display());
    let queue = Arc::new(SqliteQueue::new(&queue_path, config.job_max_attempts)?);

    let provider = Arc::new(GitHubClient::new(
        config.github_app_id,
        config.github_private_key.clone(),
    ));

    let registry = Arc::new(InstallationRegistry::new(
        store.clone(),
        provider.clone(),
        vault,
    ));

    let worker_ctx = Arc::new(WorkerContext {
        store,
        queue: queue.clone(),
        registry,
        provider,
        engine: Arc::new(NullEngine),
    });

    let shutdown = CancellationToken::new();
    let worker_handles = spawn_workers(worker_ctx, config.worker_count, shutdown.clone());
    info!("Started {} queue consumers", config.worker_count);

    let app_state = Arc::new(AppState {
        webhook_secret: config.github_webhook_secret.clone(),
        queue,
    });

    let app = webhook_router()
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain sequence: stop claiming, let in-flight jobs finish, then exit.
    info!("Shutting down: draining workers");
    shutdown.cancel();
    for handle in worker_handles {
        let _ = handle.await;
    }
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received shutdown signal");
}
