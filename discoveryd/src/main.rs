mod config;
mod store;
mod api;

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use mdns_sd::ServiceDaemon;
use anyhow::{Context, Result};
use robot_discovery::{DiscoveryClient, DiscoveryEvent};
use crate::config::Config;
use crate::store::db::DirectoryStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    tracing_subscriber::EnvFilter::new("robot_discoveryd=info,robot_discovery=info")
                })
        )
        .init();

    tracing::info!("Starting robot-discoveryd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/robot-discovery/discoveryd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    // Seed the directory from the last run
    let mut store = DirectoryStore::open(&config.store.db_path)?;
    let (services, candidates) = store.load()?;
    tracing::info!(
        "Restored {} robots and {} candidates from {:?}",
        services.len(),
        candidates.len(),
        config.store.db_path
    );

    let mut options = config.discovery.options();
    options.services = services;
    options.candidates = candidates;

    let mdns_daemon = ServiceDaemon::new()
        .context("Failed to create mDNS daemon")?;

    let client = DiscoveryClient::spawn_default(
        options,
        config.discovery.probe(),
        mdns_daemon.clone(),
        &config.discovery.service_type,
    )?;

    for candidate in &config.discovery.manual_candidates {
        client.add(candidate.ip.clone(), candidate.port).await?;
    }

    client.start().await?;

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Log discovery events
    let mut events = client.subscribe();
    let events_cancel = cancel.clone();
    let events_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(DiscoveryEvent::Service(Some(service))) => {
                        tracing::debug!("Robot updated: {}", service.name);
                    }
                    Ok(DiscoveryEvent::Service(None)) => {}
                    Ok(DiscoveryEvent::ServiceRemoved(records)) => {
                        tracing::info!("Robot removed ({} addresses)", records.len());
                    }
                    Ok(DiscoveryEvent::Error(e)) => {
                        tracing::error!("Discovery error: {:#}", e);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Event logger lagged by {} events", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = events_cancel.cancelled() => break,
            }
        }
    });

    // Persist the directory whenever it changed since the last save
    let persist_cancel = cancel.clone();
    let persist_client = client.clone();
    let persist_every = Duration::from_secs(config.store.persist_interval_secs.max(1));
    let persist_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(persist_every);
        let mut saved = String::new();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let fingerprint = persist_client.fingerprint();
                    if fingerprint == saved {
                        continue;
                    }
                    match store.save(&persist_client.services(), &persist_client.candidates()) {
                        Ok(()) => saved = fingerprint,
                        Err(e) => tracing::error!("Failed to persist directory: {:#}", e),
                    }
                }
                _ = persist_cancel.cancelled() => break,
            }
        }
        store
    });

    // Build API router
    let app = api::routes::router(api::routes::AppState {
        client: client.clone(),
    });

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Trigger cancellation
    cancel.cancel();

    if let Err(e) = client.shutdown().await {
        tracing::error!("Failed to stop discovery: {}", e);
    }

    let (_, persisted, _) = tokio::join!(events_handle, persist_handle, server_handle);

    // Final save, including anything that changed since the last tick
    match persisted {
        Ok(mut store) => {
            if let Err(e) = store.save(&client.services(), &client.candidates()) {
                tracing::error!("Failed to persist directory: {:#}", e);
            }
        }
        Err(e) => tracing::error!("Persist task failed: {}", e),
    }

    // Shutdown mDNS daemon
    if let Err(e) = mdns_daemon.shutdown() {
        tracing::error!("Failed to shutdown mDNS daemon: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
