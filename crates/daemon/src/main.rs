// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 App Proxy Contributors

// App Proxy - Daemon
// Core service for per-application proxy tunnelling

mod allowlist;
mod api;
mod config;
mod db;
mod permission;
mod platform;
mod session;
mod state;
mod store;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use allowlist::AllowListStore;
use api::{create_router, AppState};
use config::DaemonConfig;
use db::Database;
use permission::{InteractivePermissionBroker, StaticPermissionBroker};
use platform::{CommandEngine, CommandTunAllocator};
use session::{PermissionBroker, SessionController};
use store::ConfigStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "app_proxy_daemon=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("App Proxy Daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Load daemon configuration
    let daemon_config = DaemonConfig::load()?;
    info!("Bind address: {}", daemon_config.bind_address);
    info!("Engine binary: {}", daemon_config.engine_binary);

    let database = Database::open(&daemon_config.database_path).await?;
    let config_store = ConfigStore::new(&database);
    let allow_list = AllowListStore::new(&database);

    let allocator = Arc::new(CommandTunAllocator::new(daemon_config.tun_name.clone()));
    let engine = Arc::new(CommandEngine::new(daemon_config.engine_binary.clone()));

    // Headless deployments pre-approve the grant; otherwise the operator
    // answers through POST /api/permission.
    let interactive_broker = if daemon_config.auto_grant_permission {
        info!("Tunnel permission is granted automatically");
        None
    } else {
        Some(Arc::new(InteractivePermissionBroker::new()))
    };
    let permissions: Arc<dyn PermissionBroker> = match &interactive_broker {
        Some(broker) => broker.clone(),
        None => Arc::new(StaticPermissionBroker::granted()),
    };

    let controller = SessionController::new(
        config_store.clone(),
        allow_list.clone(),
        allocator,
        engine,
        permissions,
        "app-proxy".to_string(),
    );

    // Subscribe to session transitions for logging
    let mut state_rx = controller.subscribe().rx;
    tokio::spawn(async move {
        while let Ok(session_state) = state_rx.recv().await {
            info!("Session state: {:?}", session_state);
        }
    });

    // Create shutdown broadcast channel for graceful SSE stream termination
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let state = Arc::new(AppState {
        store: config_store,
        allow_list,
        controller: controller.clone(),
        permission: interactive_broker,
        shutdown_tx: shutdown_tx.clone(),
    });

    let app = create_router(state);

    info!("Daemon listening on: {}", daemon_config.bind_address);
    info!("Daemon started successfully");

    let listener = tokio::net::TcpListener::bind(&daemon_config.bind_address)
        .await
        .context(format!("Failed to bind to {}", daemon_config.bind_address))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(controller, shutdown_tx))
        .await
        .context("Server error")?;

    info!("Daemon shut down");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, tear the session down, and close SSE streams
async fn shutdown_signal(
    controller: SessionController,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("Failed to install SIGTERM handler");

    #[cfg(unix)]
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
    };

    #[cfg(not(unix))]
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    };

    controller.shutdown().await;
    info!("Session stopped");

    // Signal all SSE streams to close
    let _ = shutdown_tx.send(());
}
