// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire Protocol
//!
//! One JSON object per WebSocket text frame, discriminated by `type`.
//! Inbound fields are optional at the codec level: a frame that parses but
//! lacks a required field is a validation failure, handled by the router,
//! not a malformed frame.

use serde::{Deserialize, Serialize};

use crate::store::PersistedMessage;

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Auth(AuthRequest),
    Message(ChatMessageRequest),
    Typing(TypingRequest),
    Read(ReadRequest),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageRequest {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub receiver_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingRequest {
    #[serde(default)]
    pub receiver_id: Option<String>,
}

/// Read receipt. `sender_id` is the author of the message being marked read
/// and is only used to route the receipt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadRequest {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub sender_id: Option<String>,
}

/// Events sent by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    AuthSuccess {
        #[serde(rename = "userId")]
        user_id: String,
    },
    Message {
        message: PersistedMessage,
    },
    Typing {
        #[serde(rename = "senderId")]
        sender_id: String,
    },
    Read {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }
}

/// Returns the field value unless it is absent or empty.
pub fn present(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.is_empty())
}

/// Decodes a text frame.
///
/// Valid JSON without a string `type` is treated as an unrecognized event.
pub fn decode_event(text: &str) -> Result<ClientEvent, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if !value.get("type").is_some_and(|t| t.is_string()) {
        return Ok(ClientEvent::Unknown);
    }
    serde_json::from_value(value)
}

/// Encodes an outbound event as a text frame.
pub fn encode_event(event: &ServerEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}
