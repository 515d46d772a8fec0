// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket Connection Handler
//!
//! One task per connection. The task reads that connection's frames strictly
//! in arrival order and, in the same loop, writes out events other
//! connections have routed to it through the registry.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::connection_registry::{ConnectionId, OutboundFrame};
use crate::error::{RelayError, PROCESSING_FAILED};
use crate::lifecycle::{Lifecycle, Registration};
use crate::protocol::{self, ClientEvent, ServerEvent};
use crate::router::EventRouter;
use crate::session::{AuthOutcome, Session};

/// Shared dependencies for handling a WebSocket connection.
#[derive(Clone)]
pub struct ConnectionDeps {
    pub lifecycle: Lifecycle,
    pub router: Arc<EventRouter>,
    pub max_message_size: usize,
    /// Close connections that have not authenticated within this time.
    pub auth_timeout: Option<Duration>,
}

/// Per-connection state owned by the handler task.
struct Connection {
    id: ConnectionId,
    session: Session,
    registration: Option<Registration>,
    outbound: Option<mpsc::Receiver<OutboundFrame>>,
}

impl Connection {
    fn new() -> Self {
        Connection {
            id: ConnectionId::new(),
            session: Session::new(),
            registration: None,
            outbound: None,
        }
    }

    /// Processes one inbound text frame.
    ///
    /// Returns a reply for this connection, if any. Routed events for other
    /// users are queued by the router.
    async fn process_frame(
        &mut self,
        text: &str,
        deps: &ConnectionDeps,
    ) -> Result<Option<ServerEvent>, RelayError> {
        let event = protocol::decode_event(text)?;

        let Some(user_id) = self.session.user_id().map(str::to_string) else {
            return self.handshake(event, &deps.lifecycle);
        };

        deps.router.dispatch(&user_id, event).await?;
        Ok(None)
    }

    /// Handles a frame on an unauthenticated connection. Only `auth` does anything.
    fn handshake(
        &mut self,
        event: ClientEvent,
        lifecycle: &Lifecycle,
    ) -> Result<Option<ServerEvent>, RelayError> {
        let ClientEvent::Auth(request) = event else {
            debug!("[{}] Ignoring event before auth", self.id);
            return Ok(None);
        };

        match self.session.authenticate(&request) {
            AuthOutcome::Bound(user_id) => {
                let (registration, rx) = lifecycle.register(&user_id, self.id);
                self.registration = Some(registration);
                self.outbound = Some(rx);
                info!("[{}] Authenticated", self.id);
                Ok(Some(ServerEvent::AuthSuccess { user_id }))
            }
            AuthOutcome::MissingUserId => Err(RelayError::Validation("auth requires userId")),
            AuthOutcome::AlreadyBound | AuthOutcome::Closed => Ok(None),
        }
    }

    /// Closed transition: the registry entry goes away unless superseded.
    fn close(&mut self) {
        self.session.close();
        self.outbound = None;
        self.registration = None;
    }
}

/// Waits for the next routed frame, or forever if the connection has no queue.
async fn next_routed(
    outbound: &mut Option<mpsc::Receiver<OutboundFrame>>,
) -> Option<OutboundFrame> {
    match outbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn send_event<S>(
    write: &mut SplitSink<WebSocketStream<S>, Message>,
    event: &ServerEvent,
) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let text = protocol::encode_event(event)?;
    write.send(Message::Text(text)).await?;
    Ok(())
}

/// Handles a WebSocket connection until it closes.
pub async fn handle_connection<S>(ws_stream: WebSocketStream<S>, deps: ConnectionDeps)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let metrics = deps.lifecycle.metrics().clone();
    let mut conn = Connection::new();
    let auth_deadline = deps.auth_timeout.map(|limit| Instant::now() + limit);
    let (mut write, mut read) = ws_stream.split();

    debug!("[{}] Connection opened", conn.id);

    loop {
        let msg = tokio::select! {
            msg = read.next() => msg,
            routed = next_routed(&mut conn.outbound) => {
                match routed {
                    Some(frame) => {
                        if let Err(e) = write.send(Message::Text(frame.text)).await {
                            warn!("[{}] Failed to deliver routed event: {}", conn.id, e);
                            metrics.connection_errors.inc();
                            break;
                        }
                    }
                    None => {
                        // A newer connection registered the same user.
                        debug!("[{}] Superseded by a newer connection", conn.id);
                        conn.outbound = None;
                    }
                }
                continue;
            }
            _ = wait_until(auth_deadline), if !conn.session.is_authenticated() => {
                warn!("[{}] No auth before timeout, closing", conn.id);
                break;
            }
        };

        let text = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    metrics.frames_received.inc();
                    metrics.frames_rejected.inc();
                    debug!("[{}] Non UTF-8 binary frame", conn.id);
                    if send_event(&mut write, &ServerEvent::error(PROCESSING_FAILED))
                        .await
                        .is_err()
                    {
                        break;
                    }
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) | None => {
                debug!("[{}] Disconnected", conn.id);
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!("[{}] Transport error: {}", conn.id, e);
                metrics.connection_errors.inc();
                break;
            }
        };

        metrics.frames_received.inc();

        if text.len() > deps.max_message_size {
            warn!("[{}] Frame too large: {} bytes", conn.id, text.len());
            metrics.frames_rejected.inc();
            if send_event(&mut write, &ServerEvent::error("Message too large"))
                .await
                .is_err()
            {
                break;
            }
            continue;
        }

        let timer = metrics.frame_duration.start_timer();
        let result = conn.process_frame(&text, &deps).await;
        timer.observe_duration();

        let reply = match result {
            Ok(reply) => reply,
            Err(RelayError::Validation(reason)) => {
                debug!("[{}] Dropped event: {}", conn.id, reason);
                None
            }
            Err(e) => {
                match &e {
                    RelayError::Store(_) => error!("[{}] Store failure: {}", conn.id, e),
                    _ => debug!("[{}] Rejected frame: {}", conn.id, e),
                }
                metrics.frames_rejected.inc();
                e.client_notice().map(ServerEvent::error)
            }
        };

        if let Some(reply) = reply {
            if let Err(e) = send_event(&mut write, &reply).await {
                warn!("[{}] Failed to send reply: {}", conn.id, e);
                metrics.connection_errors.inc();
                break;
            }
        }
    }

    conn.close();
    debug!("[{}] Connection closed", conn.id);
}
