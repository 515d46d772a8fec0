// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Session Handshake
//!
//! Per-connection gate: nothing is routed until an `auth` event has bound a
//! user identity to the connection. The binding is permanent for the life of
//! the connection.

use crate::protocol::{present, AuthRequest};

/// Handshake state of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated { user_id: String },
    Closed,
}

/// Result of offering an `auth` event to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Identity bound; the caller registers the connection and acknowledges.
    Bound(String),
    /// The frame carried no user id.
    MissingUserId,
    /// The session already has an identity; the frame is ignored.
    AlreadyBound,
    /// The session is closed.
    Closed,
}

#[derive(Debug)]
pub struct Session {
    state: SessionState,
}

impl Session {
    pub fn new() -> Self {
        Session {
            state: SessionState::Unauthenticated,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// The bound identity, once authenticated.
    pub fn user_id(&self) -> Option<&str> {
        match &self.state {
            SessionState::Authenticated { user_id } => Some(user_id),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id().is_some()
    }

    /// Applies an `auth` event.
    pub fn authenticate(&mut self, request: &AuthRequest) -> AuthOutcome {
        match &self.state {
            SessionState::Authenticated { .. } => AuthOutcome::AlreadyBound,
            SessionState::Closed => AuthOutcome::Closed,
            SessionState::Unauthenticated => match present(&request.user_id) {
                Some(user_id) => {
                    self.state = SessionState::Authenticated {
                        user_id: user_id.to_string(),
                    };
                    AuthOutcome::Bound(user_id.to_string())
                }
                None => AuthOutcome::MissingUserId,
            },
        }
    }

    /// Terminal transition. Returns the identity that was bound, if any.
    pub fn close(&mut self) -> Option<String> {
        match std::mem::replace(&mut self.state, SessionState::Closed) {
            SessionState::Authenticated { user_id } => Some(user_id),
            _ => None,
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
