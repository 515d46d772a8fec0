// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Chat Relay Server
//!
//! One-to-one real-time chat relay.
//! Provides:
//! - WebSocket endpoint for authenticating users and routing chat events
//! - Persistence of chat messages and read state
//! - HTTP endpoints for health checks and Prometheus metrics

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use chat_relay::config::RelayConfig;
use chat_relay::http::{create_router, HttpState};
use chat_relay::metrics::RelayMetrics;
use chat_relay::server::Relay;
use chat_relay::store::{create_message_store, seed_demo_users, MessageStore};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chat_relay=info".parse().unwrap()),
        )
        .init();

    let config = RelayConfig::from_env();

    info!("Starting Chat Relay Server v{}", env!("CARGO_PKG_VERSION"));
    info!("WebSocket: {}{}", config.listen_addr, config.ws_path);
    info!("Metrics endpoint: {}", config.metrics_addr);
    info!("Storage backend: {:?}", config.storage_backend);
    info!("Max connections: {}", config.max_connections);
    match config.auth_timeout() {
        Some(limit) => info!("Auth timeout: {}s", limit.as_secs()),
        None => info!("Auth timeout: disabled"),
    }

    let store: Arc<dyn MessageStore> =
        match create_message_store(config.storage_backend, &config.data_dir) {
            Ok(store) => Arc::from(store),
            Err(e) => {
                error!("Failed to open message store: {}", e);
                std::process::exit(1);
            }
        };

    if config.seed_demo_users {
        match seed_demo_users(store.as_ref()) {
            Ok(count) => info!("Seeded {} demo users", count),
            Err(e) => warn!("Failed to seed demo users: {}", e),
        }
    }

    let metrics = RelayMetrics::new();
    let relay = Arc::new(Relay::new(&config, store, metrics.clone()));

    // Health/metrics server
    let http_state = HttpState {
        metrics,
        metrics_token: config.metrics_token.clone(),
        relay: relay.clone(),
    };
    let http_router = create_router(http_state);
    let http_listener = match TcpListener::bind(config.metrics_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind HTTP listener on {}: {}", config.metrics_addr, e);
            std::process::exit(1);
        }
    };
    let http_addr = config.metrics_addr;
    tokio::spawn(async move {
        info!("HTTP server listening on {}", http_addr);
        if let Err(e) = axum::serve(http_listener, http_router).await {
            error!("HTTP server error: {}", e);
        }
    });

    let listener = match TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind WebSocket listener on {}: {}", config.listen_addr, e);
            std::process::exit(1);
        }
    };
    info!("WebSocket server listening on {}", config.listen_addr);

    relay
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await;
}
