use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use lounge_types::models::ReactionMap;

/// Longest emoji string accepted (a few code points with modifiers).
pub const MAX_EMOJI_BYTES: usize = 32;

/// Per-room, per-message emoji reactions.
///
/// `react` and `unreact` are both idempotent: a user contributes at most one
/// count per (message, emoji). Both return the message's full reaction map.
#[derive(Default)]
pub struct MessageReactionAggregator {
    /// room id -> message id -> reactions
    rooms: Mutex<HashMap<String, HashMap<String, ReactionMap>>>,
}

pub fn valid_emoji(emoji: &str) -> bool {
    !emoji.trim().is_empty() && emoji.len() <= MAX_EMOJI_BYTES
}

impl MessageReactionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_rooms<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut HashMap<String, HashMap<String, ReactionMap>>) -> T,
    {
        let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut rooms)
    }

    pub fn react(&self, room_id: &str, message_id: &str, emoji: &str, user_id: &str) -> ReactionMap {
        self.with_rooms(|rooms| {
            let reactions = rooms
                .entry(room_id.to_string())
                .or_default()
                .entry(message_id.to_string())
                .or_default();
            let group = reactions.entry(emoji.to_string()).or_default();
            if group.reactors.insert(user_id.to_string()) {
                group.count += 1;
            }
            reactions.clone()
        })
    }

    pub fn unreact(&self, room_id: &str, message_id: &str, emoji: &str, user_id: &str) -> ReactionMap {
        self.with_rooms(|rooms| {
            let Some(messages) = rooms.get_mut(room_id) else {
                return ReactionMap::new();
            };
            let Some(reactions) = messages.get_mut(message_id) else {
                return ReactionMap::new();
            };
            if let Some(group) = reactions.get_mut(emoji) {
                if group.reactors.remove(user_id) {
                    group.count -= 1;
                }
                if group.count == 0 {
                    reactions.remove(emoji);
                }
            }
            let current = reactions.clone();
            if reactions.is_empty() {
                messages.remove(message_id);
            }
            current
        })
    }

    pub fn reactions(&self, room_id: &str, message_id: &str) -> ReactionMap {
        self.with_rooms(|rooms| {
            rooms
                .get(room_id)
                .and_then(|messages| messages.get(message_id))
                .cloned()
                .unwrap_or_default()
        })
    }

    /// Adopt a message's full reaction map as computed elsewhere.
    pub fn replace(&self, room_id: &str, message_id: &str, reactions: ReactionMap) {
        self.with_rooms(|rooms| {
            let messages = rooms.entry(room_id.to_string()).or_default();
            if reactions.is_empty() {
                messages.remove(message_id);
            } else {
                messages.insert(message_id.to_string(), reactions);
            }
        })
    }

    /// Drop reactions for messages no longer in the room's history.
    pub fn retain_messages<F>(&self, room_id: &str, mut keep: F)
    where
        F: FnMut(&str) -> bool,
    {
        self.with_rooms(|rooms| {
            if let Some(messages) = rooms.get_mut(room_id) {
                messages.retain(|message_id, _| keep(message_id));
            }
        })
    }

    pub fn clear_room(&self, room_id: &str) {
        self.with_rooms(|rooms| {
            rooms.remove(room_id);
        })
    }
}
