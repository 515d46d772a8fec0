// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Event Router
//!
//! Dispatches events from authenticated connections. Durable events (chat
//! messages, read receipts) hit the store exactly once before any routing;
//! a store failure aborts the frame. Routing is best effort: an offline
//! receiver simply gets nothing, and nothing is queued for later.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::connection_registry::{ConnectionRegistry, Delivery, OutboundFrame};
use crate::error::{RelayError, StoreError};
use crate::metrics::RelayMetrics;
use crate::protocol::{
    self, present, ChatMessageRequest, ClientEvent, ReadRequest, ServerEvent, TypingRequest,
};
use crate::store::MessageStore;

pub struct EventRouter {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn MessageStore>,
    metrics: RelayMetrics,
}

impl EventRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn MessageStore>,
        metrics: RelayMetrics,
    ) -> Self {
        EventRouter {
            registry,
            store,
            metrics,
        }
    }

    /// Handles one event from `sender_id`, the identity bound to the
    /// originating connection.
    ///
    /// Returns the delivery outcome when the event was routed to a user,
    /// `None` when there was nobody to route to.
    pub async fn dispatch(
        &self,
        sender_id: &str,
        event: ClientEvent,
    ) -> Result<Option<Delivery>, RelayError> {
        match event {
            ClientEvent::Message(request) => self.chat_message(sender_id, request).await.map(Some),
            ClientEvent::Typing(request) => self.typing(sender_id, request).map(Some),
            ClientEvent::Read(request) => self.read(request).await,
            // Identity is bound once per connection; later auth frames are no-ops.
            ClientEvent::Auth(_) | ClientEvent::Unknown => Ok(None),
        }
    }

    async fn chat_message(
        &self,
        sender_id: &str,
        request: ChatMessageRequest,
    ) -> Result<Delivery, RelayError> {
        let content = present(&request.content)
            .ok_or(RelayError::Validation("message requires content"))?
            .to_string();
        let receiver_id = present(&request.receiver_id)
            .ok_or(RelayError::Validation("message requires receiverId"))?
            .to_string();

        let sender = sender_id.to_string();
        let receiver = receiver_id.clone();
        let message = self
            .call_store(move |store| store.create_message(&sender, &receiver, &content))
            .await?;
        self.metrics.messages_persisted.inc();
        debug!("Persisted message {}", message.id);

        self.route(&receiver_id, &ServerEvent::Message { message })
    }

    fn typing(&self, sender_id: &str, request: TypingRequest) -> Result<Delivery, RelayError> {
        let receiver_id = present(&request.receiver_id)
            .ok_or(RelayError::Validation("typing requires receiverId"))?;
        self.route(
            receiver_id,
            &ServerEvent::Typing {
                sender_id: sender_id.to_string(),
            },
        )
    }

    async fn read(&self, request: ReadRequest) -> Result<Option<Delivery>, RelayError> {
        let message_id = present(&request.message_id)
            .ok_or(RelayError::Validation("read requires messageId"))?
            .to_string();

        let id = message_id.clone();
        self.call_store(move |store| store.mark_message_read(&id))
            .await?;

        // The receipt goes to whoever the client names as the author.
        match present(&request.sender_id) {
            Some(author_id) => self
                .route(author_id, &ServerEvent::Read { message_id })
                .map(Some),
            None => Ok(None),
        }
    }

    /// Queues an event on the receiver's connection without waiting.
    fn route(&self, receiver_id: &str, event: &ServerEvent) -> Result<Delivery, RelayError> {
        let text = protocol::encode_event(event)?;
        let delivery = self.registry.try_send(receiver_id, OutboundFrame { text });
        match delivery {
            Delivery::Queued => self.metrics.events_delivered.inc(),
            Delivery::Dropped => {
                self.metrics.events_dropped.inc();
                warn!("Receiver queue full, event dropped");
            }
            Delivery::Offline => {}
        }
        Ok(delivery)
    }

    /// Runs a store call on the blocking pool so only this connection waits.
    async fn call_store<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: FnOnce(&dyn MessageStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || call(store.as_ref()))
            .await
            .unwrap_or_else(|e| {
                Err(StoreError::Unavailable(format!("store task failed: {}", e)))
            });
        if result.is_err() {
            self.metrics.store_errors.inc();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_registry::ConnectionId;
    use crate::protocol::AuthRequest;
    use crate::store::{MemoryMessageStore, PersistedMessage, UserProfile};

    struct Fixture {
        router: EventRouter,
        registry: Arc<ConnectionRegistry>,
        store: Arc<MemoryMessageStore>,
        metrics: RelayMetrics,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::default());
        let store = Arc::new(MemoryMessageStore::new());
        for id in ["u1", "u2"] {
            store
                .upsert_user(&UserProfile {
                    id: id.to_string(),
                    name: Some(id.to_uppercase()),
                    email: format!("{}@example.com", id),
                    image: None,
                })
                .unwrap();
        }
        let metrics = RelayMetrics::new();
        let router = EventRouter::new(
            registry.clone(),
            store.clone() as Arc<dyn MessageStore>,
            metrics.clone(),
        );
        Fixture {
            router,
            registry,
            store,
            metrics,
        }
    }

    fn message(content: &str, receiver: &str) -> ClientEvent {
        ClientEvent::Message(ChatMessageRequest {
            content: Some(content.to_string()),
            receiver_id: Some(receiver.to_string()),
        })
    }

    fn decode(frame: OutboundFrame) -> ServerEvent {
        serde_json::from_str(&frame.text).unwrap()
    }

    #[tokio::test]
    async fn test_message_to_online_receiver() {
        let fx = fixture();
        let mut rx = fx.registry.register("u2", ConnectionId::new());

        let outcome = fx.router.dispatch("u1", message("hi", "u2")).await.unwrap();
        assert_eq!(outcome, Some(Delivery::Queued));

        match decode(rx.recv().await.unwrap()) {
            ServerEvent::Message { message } => {
                assert_eq!(message.content, "hi");
                assert_eq!(message.sender_id, "u1");
                assert_eq!(message.receiver_id, "u2");
                assert_eq!(message.sender.name.as_deref(), Some("U1"));
            }
            other => panic!("Expected message, got {:?}", other),
        }
        assert!(rx.try_recv().is_err(), "exactly one event");
        assert_eq!(fx.store.message_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_message_to_offline_receiver_is_still_persisted() {
        let fx = fixture();

        let outcome = fx.router.dispatch("u1", message("later", "u2")).await.unwrap();
        assert_eq!(outcome, Some(Delivery::Offline));
        assert_eq!(fx.store.message_count().unwrap(), 1);
        assert_eq!(fx.metrics.messages_persisted.get(), 1);
    }

    #[tokio::test]
    async fn test_sender_gets_no_echo() {
        let fx = fixture();
        let mut sender_rx = fx.registry.register("u1", ConnectionId::new());
        let _receiver_rx = fx.registry.register("u2", ConnectionId::new());

        fx.router.dispatch("u1", message("hi", "u2")).await.unwrap();
        assert!(sender_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_message_missing_fields_is_dropped_without_store_call() {
        let fx = fixture();
        let cases = [
            ClientEvent::Message(ChatMessageRequest {
                content: None,
                receiver_id: Some("u2".to_string()),
            }),
            ClientEvent::Message(ChatMessageRequest {
                content: Some(String::new()),
                receiver_id: Some("u2".to_string()),
            }),
            ClientEvent::Message(ChatMessageRequest {
                content: Some("hi".to_string()),
                receiver_id: None,
            }),
        ];

        for event in cases {
            let err = fx.router.dispatch("u1", event).await.unwrap_err();
            assert!(matches!(err, RelayError::Validation(_)));
        }
        assert_eq!(fx.store.message_count().unwrap(), 0);
    }

    /// A store whose backend is gone.
    struct UnavailableStore;

    impl MessageStore for UnavailableStore {
        fn upsert_user(&self, _user: &UserProfile) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("offline".to_string()))
        }

        fn ensure_user(&self, _user_id: &str) -> Result<UserProfile, StoreError> {
            Err(StoreError::Unavailable("offline".to_string()))
        }

        fn create_message(
            &self,
            _sender_id: &str,
            _receiver_id: &str,
            _content: &str,
        ) -> Result<PersistedMessage, StoreError> {
            Err(StoreError::Unavailable("offline".to_string()))
        }

        fn mark_message_read(&self, _message_id: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("offline".to_string()))
        }

        fn get_message(
            &self,
            _message_id: &str,
        ) -> Result<Option<PersistedMessage>, StoreError> {
            Err(StoreError::Unavailable("offline".to_string()))
        }

        fn message_count(&self) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable("offline".to_string()))
        }
    }

    #[tokio::test]
    async fn test_store_failure_aborts_routing() {
        let registry = Arc::new(ConnectionRegistry::default());
        let metrics = RelayMetrics::new();
        let router = EventRouter::new(
            registry.clone(),
            Arc::new(UnavailableStore),
            metrics.clone(),
        );
        let mut rx = registry.register("u2", ConnectionId::new());

        let err = router.dispatch("u1", message("hi", "u2")).await.unwrap_err();
        assert!(matches!(err, RelayError::Store(StoreError::Unavailable(_))));
        assert!(err.client_notice().is_some());

        let err = router
            .dispatch(
                "u1",
                ClientEvent::Read(ReadRequest {
                    message_id: Some("m1".to_string()),
                    sender_id: Some("u2".to_string()),
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Store(_)));

        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.store_errors.get(), 2);
        assert_eq!(metrics.messages_persisted.get(), 0);
    }

    #[tokio::test]
    async fn test_message_between_unseen_users_is_delivered() {
        let registry = Arc::new(ConnectionRegistry::default());
        let store = Arc::new(MemoryMessageStore::new());
        let router = EventRouter::new(
            registry.clone(),
            store.clone() as Arc<dyn MessageStore>,
            RelayMetrics::new(),
        );
        let mut rx = registry.register("bob", ConnectionId::new());

        let outcome = router.dispatch("alice", message("hi", "bob")).await.unwrap();
        assert_eq!(outcome, Some(Delivery::Queued));
        match decode(rx.recv().await.unwrap()) {
            ServerEvent::Message { message } => assert_eq!(message.sender.id, "alice"),
            other => panic!("Expected message, got {:?}", other),
        }
        assert_eq!(store.user_count(), 2);
    }

    #[tokio::test]
    async fn test_typing_forwards_sender_identity() {
        let fx = fixture();
        let mut rx = fx.registry.register("u2", ConnectionId::new());

        let outcome = fx
            .router
            .dispatch(
                "u1",
                ClientEvent::Typing(TypingRequest {
                    receiver_id: Some("u2".to_string()),
                }),
            )
            .await
            .unwrap();

        assert_eq!(outcome, Some(Delivery::Queued));
        assert_eq!(
            decode(rx.recv().await.unwrap()),
            ServerEvent::Typing {
                sender_id: "u1".to_string()
            }
        );
        assert_eq!(fx.store.message_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_typing_without_receiver_is_dropped() {
        let fx = fixture();
        let err = fx
            .router
            .dispatch("u1", ClientEvent::Typing(TypingRequest::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }

    fn persisted(fx: &Fixture) -> PersistedMessage {
        fx.store.create_message("u1", "u2", "read me").unwrap()
    }

    #[tokio::test]
    async fn test_read_receipt_to_online_sender() {
        let fx = fixture();
        let msg = persisted(&fx);
        let mut author_rx = fx.registry.register("u1", ConnectionId::new());

        let outcome = fx
            .router
            .dispatch(
                "u2",
                ClientEvent::Read(ReadRequest {
                    message_id: Some(msg.id.clone()),
                    sender_id: Some("u1".to_string()),
                }),
            )
            .await
            .unwrap();

        assert_eq!(outcome, Some(Delivery::Queued));
        assert_eq!(
            decode(author_rx.recv().await.unwrap()),
            ServerEvent::Read {
                message_id: msg.id.clone()
            }
        );
        assert!(author_rx.try_recv().is_err());
        assert!(fx.store.get_message(&msg.id).unwrap().unwrap().read);
    }

    #[tokio::test]
    async fn test_read_receipt_with_offline_or_missing_sender_still_updates() {
        let fx = fixture();
        let first = persisted(&fx);
        let second = persisted(&fx);

        let outcome = fx
            .router
            .dispatch(
                "u2",
                ClientEvent::Read(ReadRequest {
                    message_id: Some(first.id.clone()),
                    sender_id: Some("u1".to_string()),
                }),
            )
            .await
            .unwrap();
        assert_eq!(outcome, Some(Delivery::Offline));

        let outcome = fx
            .router
            .dispatch(
                "u2",
                ClientEvent::Read(ReadRequest {
                    message_id: Some(second.id.clone()),
                    sender_id: None,
                }),
            )
            .await
            .unwrap();
        assert_eq!(outcome, None);

        assert!(fx.store.get_message(&first.id).unwrap().unwrap().read);
        assert!(fx.store.get_message(&second.id).unwrap().unwrap().read);
    }

    #[tokio::test]
    async fn test_read_unknown_message_is_store_error() {
        let fx = fixture();
        let mut author_rx = fx.registry.register("u1", ConnectionId::new());

        let err = fx
            .router
            .dispatch(
                "u2",
                ClientEvent::Read(ReadRequest {
                    message_id: Some("missing".to_string()),
                    sender_id: Some("u1".to_string()),
                }),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Store(StoreError::MessageNotFound(_))));
        assert!(author_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_auth_and_unknown_are_ignored() {
        let fx = fixture();
        let auth = ClientEvent::Auth(AuthRequest {
            user_id: Some("u2".to_string()),
        });
        assert_eq!(fx.router.dispatch("u1", auth).await.unwrap(), None);
        assert_eq!(
            fx.router.dispatch("u1", ClientEvent::Unknown).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_full_receiver_queue_drops_without_blocking() {
        let registry = Arc::new(ConnectionRegistry::new(1));
        let store = Arc::new(MemoryMessageStore::new());
        let metrics = RelayMetrics::new();
        let router = EventRouter::new(registry.clone(), store, metrics.clone());
        let _rx = registry.register("u2", ConnectionId::new());

        let typing = || {
            ClientEvent::Typing(TypingRequest {
                receiver_id: Some("u2".to_string()),
            })
        };
        assert_eq!(
            router.dispatch("u1", typing()).await.unwrap(),
            Some(Delivery::Queued)
        );
        assert_eq!(
            router.dispatch("u1", typing()).await.unwrap(),
            Some(Delivery::Dropped)
        );
        assert_eq!(metrics.events_dropped.get(), 1);
    }
}
