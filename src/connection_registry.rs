// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Connection Registry
//!
//! Maps an authenticated user to the one live connection that currently
//! speaks for them, so a handler can push routed events (messages, typing
//! notices, read receipts) to another user's socket.
//!
//! Each entry holds the bounded sending half of that connection's outbound
//! queue. Sends never wait: a full queue drops the event instead of stalling
//! the routing connection.

use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Identity of one transport link, distinct from the user bound to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        ConnectionId(uuid::Uuid::new_v4())
    }

    /// Short label used to tag log lines for this connection.
    pub fn label(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// A pre-encoded text frame queued for a connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub text: String,
}

/// Outcome of routing a frame to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on the user's live connection.
    Queued,
    /// The user has no live connection.
    Offline,
    /// The user's outbound queue is full; the frame was discarded.
    Dropped,
}

struct Entry {
    connection_id: ConnectionId,
    tx: mpsc::Sender<OutboundFrame>,
}

/// Thread-safe registry of authenticated connections, keyed by user id.
///
/// Starts empty; [`ConnectionRegistry::clear`] empties it on shutdown.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Entry>>,
    buffer: usize,
}

impl ConnectionRegistry {
    /// Creates an empty registry whose per-connection queues hold `buffer` frames.
    pub fn new(buffer: usize) -> Self {
        ConnectionRegistry {
            connections: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Registers `connection_id` as the live connection for `user_id` and
    /// returns the receiving end of its outbound queue.
    ///
    /// An existing entry for the user is replaced; the superseded connection
    /// stays open but its queue closes and it receives no further routed events.
    pub fn register(
        &self,
        user_id: &str,
        connection_id: ConnectionId,
    ) -> mpsc::Receiver<OutboundFrame> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        connections.insert(user_id.to_string(), Entry { connection_id, tx });
        rx
    }

    /// Removes the entry for `user_id` only if it still belongs to `connection_id`.
    ///
    /// Returns true if an entry was removed.
    pub fn unregister(&self, user_id: &str, connection_id: ConnectionId) -> bool {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match connections.get(user_id) {
            Some(entry) if entry.connection_id == connection_id => {
                connections.remove(user_id);
                true
            }
            _ => false,
        }
    }

    /// Returns the connection currently registered for `user_id`.
    pub fn lookup(&self, user_id: &str) -> Option<ConnectionId> {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        connections.get(user_id).map(|entry| entry.connection_id)
    }

    /// Queues a frame for `user_id` without waiting.
    pub fn try_send(&self, user_id: &str, frame: OutboundFrame) -> Delivery {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = connections.get(user_id) else {
            return Delivery::Offline;
        };
        match entry.tx.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Dropped,
            // Receiver already gone: the connection is closing.
            Err(TrySendError::Closed(_)) => Delivery::Offline,
        }
    }

    /// Returns the number of users with a live connection.
    pub fn connected_count(&self) -> usize {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        connections.len()
    }

    /// Drops every entry. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let count = connections.len();
        connections.clear();
        count
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(64)
    }
}
