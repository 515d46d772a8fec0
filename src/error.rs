// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Relay Errors
//!
//! Every failure is scoped to the frame or connection that caused it; none of
//! these errors stop the relay process.

use tokio_tungstenite::tungstenite;

/// Failures reported by the message store collaborator.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Errors raised while processing a single inbound frame.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The frame is not a valid serialized event.
    #[error("malformed frame: {0}")]
    Protocol(#[from] serde_json::Error),

    /// A required field is missing; the frame is dropped without notice.
    #[error("invalid event: {0}")]
    Validation(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),
}

/// Text of the `error` event sent for any frame the relay could not process.
pub const PROCESSING_FAILED: &str = "Failed to process message";

impl RelayError {
    /// Text for the outbound `error` event, if the sender should be told.
    pub fn client_notice(&self) -> Option<&'static str> {
        match self {
            RelayError::Protocol(_) | RelayError::Store(_) => Some(PROCESSING_FAILED),
            RelayError::Validation(_) | RelayError::Transport(_) => None,
        }
    }
}
