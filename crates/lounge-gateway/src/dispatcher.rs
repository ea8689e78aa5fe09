use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, warn};
use uuid::Uuid;

use lounge_store::SharedStateStore;
use lounge_store::queries::ROOM_EVENTS_TOPIC;
use lounge_types::events::ServerEvent;

use crate::registry::RoomRegistry;

/// Who in a room receives an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    Everyone,
    /// Everyone but one connection (typically the one that caused the event).
    Except(String),
    /// Moderators, plus one extra connection (typically the author).
    ModeratorsAnd(String),
}

/// A room event as published on the cross-instance bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub origin: String,
    pub room_id: String,
    pub audience: Audience,
    pub event: ServerEvent,
}

/// Manages all connected sockets and fans events out to rooms.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Tag stamped on bus envelopes so an instance skips its own events
    instance_id: String,

    store: SharedStateStore,

    /// Room membership and history
    registry: RwLock<RoomRegistry>,

    /// Per-socket send channels: socket_id -> sender
    sockets: RwLock<HashMap<String, mpsc::UnboundedSender<ServerEvent>>>,
}

impl Dispatcher {
    pub fn new(store: SharedStateStore, instance_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                instance_id: instance_id.into(),
                store,
                registry: RwLock::new(RoomRegistry::new()),
                sockets: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn store(&self) -> &SharedStateStore {
        &self.inner.store
    }

    pub fn registry(&self) -> &RwLock<RoomRegistry> {
        &self.inner.registry
    }

    /// Register a new socket. Returns (socket_id, receiver).
    pub async fn register_socket(&self) -> (String, mpsc::UnboundedReceiver<ServerEvent>) {
        let socket_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .sockets
            .write()
            .await
            .insert(socket_id.clone(), tx);
        (socket_id, rx)
    }

    pub async fn unregister_socket(&self, socket_id: &str) {
        self.inner.sockets.write().await.remove(socket_id);
    }

    pub async fn is_connected(&self, socket_id: &str) -> bool {
        self.inner.sockets.read().await.contains_key(socket_id)
    }

    /// Send a targeted event to one socket.
    pub async fn send_to_socket(&self, socket_id: &str, event: ServerEvent) {
        let sockets = self.inner.sockets.read().await;
        if let Some(tx) = sockets.get(socket_id) {
            let _ = tx.send(event);
        }
    }

    /// Deliver to members of `room_id` on this instance and publish to the
    /// cross-instance bus.
    pub async fn broadcast_room(&self, room_id: &str, event: ServerEvent, audience: Audience) {
        self.deliver_local(room_id, &event, &audience).await;

        let envelope = BusEnvelope {
            origin: self.inner.instance_id.clone(),
            room_id: room_id.to_string(),
            audience,
            event,
        };
        match serde_json::to_string(&envelope) {
            Ok(payload) => self.inner.store.publish(ROOM_EVENTS_TOPIC, &payload).await,
            Err(e) => error!(room_id, "Could not encode bus envelope: {}", e),
        }
    }

    /// Deliver to members of `room_id` on this instance only.
    pub async fn deliver_local(&self, room_id: &str, event: &ServerEvent, audience: &Audience) {
        let recipients: Vec<String> = {
            let registry = self.inner.registry.read().await;
            let Some(room) = registry.room(room_id) else {
                return;
            };
            room.members()
                .filter(|(socket_id, user)| match audience {
                    Audience::Everyone => true,
                    Audience::Except(skip) => *socket_id != skip,
                    Audience::ModeratorsAnd(extra) => user.is_moderator() || *socket_id == extra,
                })
                .map(|(socket_id, _)| socket_id.clone())
                .collect()
        };

        debug!(
            room_id,
            kind = event.kind(),
            recipients = recipients.len(),
            "Fanning out room event"
        );

        let sockets = self.inner.sockets.read().await;
        for socket_id in &recipients {
            if let Some(tx) = sockets.get(socket_id) {
                let _ = tx.send(event.clone());
            }
        }
    }

    /// Decode a bus payload. Envelopes published by this instance are skipped.
    pub fn accept_envelope(&self, payload: &str) -> Option<BusEnvelope> {
        match serde_json::from_str::<BusEnvelope>(payload) {
            Ok(envelope) if envelope.origin == self.inner.instance_id => None,
            Ok(envelope) => Some(envelope),
            Err(e) => {
                warn!("Dropping malformed bus envelope: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lounge_types::models::{Role, User};

    async fn join(dispatcher: &Dispatcher, room: &str, user: User) -> (String, mpsc::UnboundedReceiver<ServerEvent>) {
        let (socket_id, rx) = dispatcher.register_socket().await;
        dispatcher.registry().write().await.join(room, &socket_id, user);
        (socket_id, rx)
    }

    #[tokio::test]
    async fn moderator_audience_filters_members() {
        let dispatcher = Dispatcher::new(SharedStateStore::memory(), "test");
        let mut moderator = User::guest("mod");
        moderator.role = Role::Moderator;

        let (author, mut author_rx) = join(&dispatcher, "general", User::guest("author")).await;
        let (_, mut mod_rx) = join(&dispatcher, "general", moderator).await;
        let (_, mut other_rx) = join(&dispatcher, "general", User::guest("other")).await;

        let event = ServerEvent::Error { message: "x".into() };
        dispatcher
            .broadcast_room("general", event.clone(), Audience::ModeratorsAnd(author))
            .await;

        assert_eq!(author_rx.try_recv().ok(), Some(event.clone()));
        assert_eq!(mod_rx.try_recv().ok(), Some(event));
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn own_envelopes_are_skipped() {
        let store = SharedStateStore::memory();
        let a = Dispatcher::new(store.clone(), "a");
        let b = Dispatcher::new(store, "b");

        let payload = serde_json::to_string(&BusEnvelope {
            origin: "a".into(),
            room_id: "general".into(),
            audience: Audience::Everyone,
            event: ServerEvent::Error { message: "x".into() },
        })
        .unwrap();

        assert!(a.accept_envelope(&payload).is_none());
        assert!(b.accept_envelope(&payload).is_some());
        assert!(b.accept_envelope("garbage").is_none());
    }
}
