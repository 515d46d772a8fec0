// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Relay Server
//!
//! Accept loop: admits TCP connections against the connection cap, performs
//! the WebSocket upgrade on the configured path and hands each connection to
//! its own handler task.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::connection_registry::ConnectionRegistry;
use crate::handler::{self, ConnectionDeps};
use crate::lifecycle::Lifecycle;
use crate::metrics::RelayMetrics;
use crate::router::EventRouter;
use crate::store::MessageStore;

/// Upper bound on the HTTP upgrade exchange itself.
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The assembled relay: registry, router and lifecycle state for one process.
pub struct Relay {
    deps: ConnectionDeps,
    ws_path: String,
    started_at: Instant,
}

impl Relay {
    /// Wires a relay with an empty registry.
    pub fn new(
        config: &RelayConfig,
        store: Arc<dyn MessageStore>,
        metrics: RelayMetrics,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.outbound_buffer));
        let lifecycle = Lifecycle::new(registry.clone(), config.max_connections, metrics.clone());
        let router = Arc::new(EventRouter::new(registry, store, metrics));
        Relay {
            deps: ConnectionDeps {
                lifecycle,
                router,
                max_message_size: config.max_message_size,
                auth_timeout: config.auth_timeout(),
            },
            ws_path: config.ws_path.clone(),
            started_at: Instant::now(),
        }
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.deps.lifecycle
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Accepts connections until `shutdown` resolves, then clears the registry.
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let lifecycle = self.lifecycle().clone();

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
                _ = &mut shutdown => break,
            };

            let Some(admission) = lifecycle.admit() else {
                warn!(
                    "Connection rejected: at max capacity ({}/{})",
                    lifecycle.active_count(),
                    lifecycle.max_connections()
                );
                lifecycle.metrics().connection_errors.inc();
                drop(stream);
                continue;
            };

            debug!("Accepted TCP connection from {}", peer);
            let relay = self.clone();
            tokio::spawn(async move {
                // Slot is held for the lifetime of the connection.
                let _admission = admission;
                relay.upgrade_and_handle(stream).await;
            });
        }

        let removed = lifecycle.shutdown();
        info!("Relay stopped, cleared {} registry entries", removed);
    }

    async fn upgrade_and_handle(&self, stream: TcpStream) {
        let metrics = self.lifecycle().metrics();
        let ws_path = self.ws_path.clone();
        let check_path = move |request: &Request, response: Response| {
            if request.uri().path() == ws_path {
                Ok(response)
            } else {
                let mut rejection = ErrorResponse::new(Some("Not Found".to_string()));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
        };

        let upgrade = accept_hdr_async(stream, check_path);
        match tokio::time::timeout(UPGRADE_TIMEOUT, upgrade).await {
            Ok(Ok(ws_stream)) => {
                metrics.connections_total.inc();
                info!("New WebSocket connection");
                handler::handle_connection(ws_stream, self.deps.clone()).await;
                info!("WebSocket connection closed");
            }
            Ok(Err(e)) => {
                warn!("WebSocket upgrade failed: {}", e);
                metrics.connection_errors.inc();
            }
            Err(_) => {
                warn!("WebSocket upgrade timeout");
                metrics.connection_errors.inc();
            }
        }
    }
}
