// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Relay Server Configuration
//!
//! Configuration loaded from environment variables. Unparseable values are
//! ignored and the default is kept.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::store::StorageBackend;

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to listen on for WebSocket upgrades.
    pub listen_addr: SocketAddr,
    /// Only upgrades on this path are accepted.
    pub ws_path: String,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum inbound frame size in bytes.
    pub max_message_size: usize,
    /// Capacity of each connection's queue of routed events.
    pub outbound_buffer: usize,
    /// Seconds an unauthenticated connection may stay silent. 0 disables.
    pub auth_timeout_secs: u64,
    /// Storage backend (memory or sqlite).
    pub storage_backend: StorageBackend,
    /// Data directory for persistent storage.
    pub data_dir: PathBuf,
    /// Address of the health/metrics HTTP server.
    pub metrics_addr: SocketAddr,
    /// Bearer token required on `/metrics`, if set.
    pub metrics_token: Option<String>,
    /// Insert the demo user profiles at startup.
    pub seed_demo_users: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3001)),
            ws_path: "/api/ws".to_string(),
            max_connections: 1000,
            max_message_size: 64 * 1024,
            outbound_buffer: 64,
            auth_timeout_secs: 0,
            storage_backend: StorageBackend::Sqlite,
            data_dir: PathBuf::from("./data"),
            metrics_addr: SocketAddr::from(([127, 0, 0, 1], 8081)),
            metrics_token: None,
            seed_demo_users: false,
        }
    }
}

fn parse_var<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(val) = std::env::var(name) {
        match val.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!("Ignoring invalid {}={:?}", name, val),
        }
    }
}

fn parse_flag(val: &str) -> bool {
    matches!(val.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

impl RelayConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        parse_var("RELAY_LISTEN_ADDR", &mut config.listen_addr);
        parse_var("RELAY_MAX_CONNECTIONS", &mut config.max_connections);
        parse_var("RELAY_MAX_MESSAGE_SIZE", &mut config.max_message_size);
        parse_var("RELAY_OUTBOUND_BUFFER", &mut config.outbound_buffer);
        parse_var("RELAY_AUTH_TIMEOUT", &mut config.auth_timeout_secs);
        parse_var("RELAY_METRICS_ADDR", &mut config.metrics_addr);

        if let Ok(path) = std::env::var("RELAY_WS_PATH") {
            if path.starts_with('/') {
                config.ws_path = path;
            } else {
                warn!("Ignoring RELAY_WS_PATH without leading '/': {:?}", path);
            }
        }

        if let Ok(val) = std::env::var("RELAY_STORAGE_BACKEND") {
            config.storage_backend = match val.to_lowercase().as_str() {
                "memory" => StorageBackend::Memory,
                _ => StorageBackend::Sqlite,
            };
        }

        if let Ok(val) = std::env::var("RELAY_DATA_DIR") {
            config.data_dir = PathBuf::from(val);
        }

        config.metrics_token = std::env::var("RELAY_METRICS_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());

        if let Ok(val) = std::env::var("RELAY_SEED_DEMO_USERS") {
            config.seed_demo_users = parse_flag(&val);
        }

        config
    }

    /// Returns the unauthenticated idle limit, if one is configured.
    pub fn auth_timeout(&self) -> Option<Duration> {
        (self.auth_timeout_secs > 0).then(|| Duration::from_secs(self.auth_timeout_secs))
    }
}
