// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Presence / Lifecycle Manager
//!
//! Owns the live-connection state of the relay:
//! - admission of new transport links against the connection cap,
//! - registration of authenticated connections in the [`ConnectionRegistry`],
//! - cleanup when a connection closes, errors, or the process shuts down.
//!
//! Cleanup is tied to guard lifetimes ([`Admission`], [`Registration`]), so
//! every exit path of a connection handler releases what it held.

use std::sync::Arc;

use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::connection_registry::{ConnectionId, ConnectionRegistry, OutboundFrame};
use crate::metrics::RelayMetrics;

/// Shared lifecycle state. Cheap to clone.
#[derive(Clone)]
pub struct Lifecycle {
    registry: Arc<ConnectionRegistry>,
    admission: Arc<Semaphore>,
    max_connections: usize,
    metrics: RelayMetrics,
}

impl Lifecycle {
    /// Creates the lifecycle manager with an empty registry.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        max_connections: usize,
        metrics: RelayMetrics,
    ) -> Self {
        Lifecycle {
            registry,
            admission: Arc::new(Semaphore::new(max_connections.min(Semaphore::MAX_PERMITS))),
            max_connections,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Tries to take a connection slot. `None` when at capacity or shut down.
    pub fn admit(&self) -> Option<Admission> {
        let permit = self.admission.clone().try_acquire_owned().ok()?;
        self.metrics.connections_active.inc();
        Some(Admission {
            _permit: permit,
            metrics: self.metrics.clone(),
        })
    }

    /// Number of admitted connections still open.
    pub fn active_count(&self) -> usize {
        self.max_connections
            .saturating_sub(self.admission.available_permits())
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Records `user_id` as served by `connection_id`, replacing any previous
    /// connection for that user.
    ///
    /// The returned guard removes the entry when dropped, unless a newer
    /// connection has taken it over by then.
    pub fn register(
        &self,
        user_id: &str,
        connection_id: ConnectionId,
    ) -> (Registration, mpsc::Receiver<OutboundFrame>) {
        let rx = self.registry.register(user_id, connection_id);
        self.metrics
            .users_online
            .set(self.registry.connected_count() as i64);
        let registration = Registration {
            user_id: user_id.to_string(),
            connection_id,
            registry: self.registry.clone(),
            metrics: self.metrics.clone(),
        };
        (registration, rx)
    }

    /// Stops admitting connections and empties the registry.
    ///
    /// Returns the number of registry entries removed.
    pub fn shutdown(&self) -> usize {
        self.admission.close();
        let removed = self.registry.clear();
        self.metrics.users_online.set(0);
        removed
    }
}

/// A held connection slot. Released on drop.
pub struct Admission {
    _permit: OwnedSemaphorePermit,
    metrics: RelayMetrics,
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.metrics.connections_active.dec();
    }
}

/// Registry membership of one authenticated connection.
pub struct Registration {
    user_id: String,
    connection_id: ConnectionId,
    registry: Arc<ConnectionRegistry>,
    metrics: RelayMetrics,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.registry.unregister(&self.user_id, self.connection_id) {
            debug!("[{}] Removed from registry", self.connection_id);
        } else {
            debug!(
                "[{}] Registry entry already superseded, leaving it",
                self.connection_id
            );
        }
        self.metrics
            .users_online
            .set(self.registry.connected_count() as i64);
    }
}
