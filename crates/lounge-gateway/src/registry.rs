use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use lounge_types::models::{ChatMessage, Peer, User};

/// Messages kept per room for history replay.
pub const HISTORY_CAP: usize = 200;

/// How long a departed connection's identity can be reclaimed.
pub const IDENTITY_GRACE: Duration = Duration::from_secs(60);

/// A chat message as kept in room history.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub message: ChatMessage,
    /// Sent while the author was shadow-muted. Stays hidden from ordinary
    /// members even after the mute is lifted.
    pub shadowed: bool,
    /// Moderation key of the author, for native messages.
    pub author_key: Option<String>,
}

#[derive(Debug, Default)]
pub struct Room {
    /// socket id -> user, ordered for stable member listings
    members: BTreeMap<String, User>,
    history: VecDeque<StoredMessage>,
}

impl Room {
    pub fn members(&self) -> impl Iterator<Item = (&String, &User)> {
        self.members.iter()
    }

    pub fn history(&self) -> impl Iterator<Item = &StoredMessage> {
        self.history.iter()
    }

    pub fn has_message(&self, message_id: &str) -> bool {
        self.history.iter().any(|m| m.message.id == message_id)
    }

    /// Append to history, evicting the oldest entry past the cap.
    pub fn push_message(&mut self, message: StoredMessage) {
        if self.history.len() == HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back(message);
    }
}

#[derive(Debug, Clone)]
pub struct CachedIdentity {
    pub user: User,
    pub room_id: String,
    cached_at: Instant,
}

/// Result of removing a connection from its room.
#[derive(Debug, Clone)]
pub struct Departure {
    pub room_id: String,
    pub user: User,
    /// The room had no members left and was destroyed.
    pub room_emptied: bool,
}

/// Which connections belong to which room, plus the last-known identity of
/// recently departed connections for reconnect continuity.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
    socket_rooms: HashMap<String, String>,
    identities: HashMap<String, CachedIdentity>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `socket_id` in `room_id`, leaving any previous room first.
    /// Returns the departure from the previous room, if there was one.
    pub fn join(&mut self, room_id: &str, socket_id: &str, user: User) -> Option<Departure> {
        let moving = self
            .socket_rooms
            .get(socket_id)
            .is_some_and(|current| current != room_id);
        let previous = if moving {
            self.remove_member(socket_id)
        } else {
            None
        };
        self.rooms
            .entry(room_id.to_string())
            .or_default()
            .members
            .insert(socket_id.to_string(), user);
        self.socket_rooms
            .insert(socket_id.to_string(), room_id.to_string());
        previous
    }

    /// Remove a connection, caching its identity for [`IDENTITY_GRACE`].
    pub fn leave(&mut self, socket_id: &str, now: Instant) -> Option<Departure> {
        let departure = self.remove_member(socket_id)?;
        self.identities.insert(
            socket_id.to_string(),
            CachedIdentity {
                user: departure.user.clone(),
                room_id: departure.room_id.clone(),
                cached_at: now,
            },
        );
        Some(departure)
    }

    fn remove_member(&mut self, socket_id: &str) -> Option<Departure> {
        let room_id = self.socket_rooms.remove(socket_id)?;
        let room = self.rooms.get_mut(&room_id)?;
        let user = room.members.remove(socket_id)?;
        let room_emptied = room.members.is_empty();
        if room_emptied {
            self.rooms.remove(&room_id);
        }
        Some(Departure {
            room_id,
            user,
            room_emptied,
        })
    }

    /// Reclaim the identity of a previous connection. Each cached identity can
    /// be claimed once, and only within the grace window.
    pub fn reclaim_identity(&mut self, previous_socket_id: &str, now: Instant) -> Option<CachedIdentity> {
        let cached = self.identities.remove(previous_socket_id)?;
        (now.duration_since(cached.cached_at) <= IDENTITY_GRACE).then_some(cached)
    }

    pub fn prune_identities(&mut self, now: Instant) -> usize {
        let before = self.identities.len();
        self.identities
            .retain(|_, cached| now.duration_since(cached.cached_at) <= IDENTITY_GRACE);
        before - self.identities.len()
    }

    pub fn room_of(&self, socket_id: &str) -> Option<&str> {
        self.socket_rooms.get(socket_id).map(String::as_str)
    }

    pub fn room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn room_mut(&mut self, room_id: &str) -> Option<&mut Room> {
        self.rooms.get_mut(room_id)
    }

    pub fn room_ids(&self) -> Vec<String> {
        self.rooms.keys().cloned().collect()
    }

    pub fn user(&self, socket_id: &str) -> Option<&User> {
        let room_id = self.socket_rooms.get(socket_id)?;
        self.rooms.get(room_id)?.members.get(socket_id)
    }

    pub fn user_mut(&mut self, socket_id: &str) -> Option<&mut User> {
        let room_id = self.socket_rooms.get(socket_id)?;
        self.rooms.get_mut(room_id)?.members.get_mut(socket_id)
    }

    pub fn peers(&self, room_id: &str) -> Vec<Peer> {
        self.rooms
            .get(room_id)
            .map(|room| {
                room.members
                    .iter()
                    .map(|(socket_id, user)| Peer {
                        socket_id: socket_id.clone(),
                        user: user.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lounge_types::models::MessageSource;

    fn message(id: &str) -> StoredMessage {
        StoredMessage {
            message: ChatMessage {
                id: id.into(),
                room_id: "general".into(),
                text: "hi".into(),
                sender: "ann".into(),
                sender_id: None,
                sender_color: None,
                timestamp: 0,
                source: MessageSource::Native,
                channel: None,
            },
            shadowed: false,
            author_key: Some("ann".into()),
        }
    }

    #[test]
    fn join_moves_between_rooms() {
        let mut reg = RoomRegistry::new();
        assert!(reg.join("a", "s1", User::guest("ann")).is_none());
        let moved = reg.join("b", "s1", User::guest("ann")).unwrap();
        assert_eq!(moved.room_id, "a");
        assert!(moved.room_emptied);
        assert!(reg.room("a").is_none());
        assert_eq!(reg.room_of("s1"), Some("b"));
    }

    #[test]
    fn last_leave_destroys_room() {
        let mut reg = RoomRegistry::new();
        let now = Instant::now();
        reg.join("a", "s1", User::guest("ann"));
        reg.join("a", "s2", User::guest("bob"));

        let first = reg.leave("s1", now).unwrap();
        assert!(!first.room_emptied);
        let second = reg.leave("s2", now).unwrap();
        assert!(second.room_emptied);
        assert!(reg.room("a").is_none());
        assert!(reg.leave("s2", now).is_none());
    }

    #[test]
    fn history_is_capped_oldest_first() {
        let mut reg = RoomRegistry::new();
        reg.join("a", "s1", User::guest("ann"));
        let room = reg.room_mut("a").unwrap();
        for i in 0..=HISTORY_CAP {
            room.push_message(message(&format!("m{}", i)));
        }
        assert_eq!(room.history().count(), HISTORY_CAP);
        assert!(!room.has_message("m0"));
        assert!(room.has_message(&format!("m{}", HISTORY_CAP)));
    }

    #[test]
    fn identity_reclaimed_once_within_grace() {
        let mut reg = RoomRegistry::new();
        let now = Instant::now();
        let mut user = User::guest("ann");
        user.avatar = Some("fox".into());
        reg.join("a", "s1", user.clone());
        reg.leave("s1", now);

        let cached = reg.reclaim_identity("s1", now + Duration::from_secs(10)).unwrap();
        assert_eq!(cached.user, user);
        assert_eq!(cached.room_id, "a");
        assert!(reg.reclaim_identity("s1", now).is_none());
    }

    #[test]
    fn identity_expires_after_grace() {
        let mut reg = RoomRegistry::new();
        let now = Instant::now();
        reg.join("a", "s1", User::guest("ann"));
        reg.join("a", "s2", User::guest("bob"));
        reg.leave("s1", now);
        reg.leave("s2", now);

        let later = now + IDENTITY_GRACE + Duration::from_secs(1);
        assert!(reg.reclaim_identity("s1", later).is_none());
        assert_eq!(reg.prune_identities(later), 1);
    }
}
