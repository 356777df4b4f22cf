use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokenbridge::api::{create_router, AppState};
use tokenbridge::bridge::OAuthBridge;
use tokenbridge::config::BridgeConfig;
use tokenbridge::credentials::{run_prune_loop, CredentialStore, FileLock};
use tokenbridge::provider::HttpProvider;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tokenbridge=info".into()),
        )
        .init();

    info!("Token bridge starting...");

    // Configuration errors are fatal
    let config = Arc::new(BridgeConfig::from_env().context("Invalid configuration")?);
    let storage = &config.settings.storage;

    info!(
        base_url = %config.base_url,
        store_path = %config.store_path.display(),
        lock_path = %config.lock_path.display(),
        rate_limit_enabled = config.settings.rate_limit.enabled,
        cors_origins = config.cors_origins.len(),
        "Configuration loaded"
    );

    // Initialize credential store
    let lock = FileLock::new(
        &config.lock_path,
        Duration::from_millis(storage.lock_timeout_ms),
        Duration::from_millis(storage.lock_retry_ms),
    );
    let store = Arc::new(
        CredentialStore::new(
            &config.store_path,
            lock,
            config.encryption_key.clone(),
            config.prune_retention(),
        )
        .context("Failed to initialize credential store")?,
    );
    info!("Credential store initialized");

    let provider = Arc::new(
        HttpProvider::new(config.provider.clone()).context("Failed to initialize provider client")?,
    );

    let bridge = Arc::new(
        OAuthBridge::new(Arc::clone(&config), Arc::clone(&store), provider)
            .context("Failed to initialize OAuth bridge")?,
    );

    // Background maintenance
    let mut background = bridge.spawn_sweepers();
    background.push(tokio::spawn(run_prune_loop(
        Arc::clone(&store),
        storage.prune_interval_seconds.max(1),
    )));

    // Start HTTP server
    let router = create_router(AppState {
        bridge: Arc::clone(&bridge),
    });
    let bind_addr = config.settings.server.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!(bind_addr = %bind_addr, "Token bridge listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    server_handle.abort();
    for task in background {
        task.abort();
    }
    info!("Token bridge stopped");

    Ok(())
}
