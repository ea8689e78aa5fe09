use std::collections::{HashMap, HashSet};
use std::time::Duration;

use lounge_types::models::TubeState;
use tracing::warn;

use crate::{Result, SharedStateStore};

// -- Key namespace --

pub const TUBE_STATES: &str = "tube_states";
/// room id -> wall-clock ms at which the room emptied
pub const TUBE_IDLE: &str = "tube_idle";
pub const SHADOW_MUTED: &str = "shadow_muted";
/// Sorted by wipe time in ms
pub const WIPED_USERS: &str = "wiped_users";
/// Sorted by wipe time in ms
pub const WIPED_MESSAGES: &str = "wiped_messages";
/// user key -> wall-clock ms at which the camera ban lifts
pub const CAM_BANS: &str = "cam_bans";
pub const ROOM_EVENTS_TOPIC: &str = "room_events";

pub const WIPE_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
pub const IRC_LIMIT_WINDOW: Duration = Duration::from_secs(60);
/// New IRC connections allowed per user per window.
pub const IRC_LIMIT_MAX: i64 = 1;

fn retention_floor(now_ms: i64) -> i64 {
    now_ms - WIPE_RETENTION.as_millis() as i64
}

fn irc_limit_key(user_id: &str) -> String {
    format!("irc_limit:{}", user_id)
}

impl SharedStateStore {
    // -- Tube --

    pub async fn set_tube_state(&self, room_id: &str, state: &TubeState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        self.hash_set(TUBE_STATES, room_id, &json).await;
        Ok(())
    }

    pub async fn get_tube_state(&self, room_id: &str) -> Result<Option<TubeState>> {
        match self.hash_get(TUBE_STATES, room_id).await {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Every persisted tube state. Entries that fail to decode are skipped.
    pub async fn get_all_tube_states(&self) -> HashMap<String, TubeState> {
        self.hash_get_all(TUBE_STATES)
            .await
            .into_iter()
            .filter_map(|(room_id, json)| match serde_json::from_str(&json) {
                Ok(state) => Some((room_id, state)),
                Err(e) => {
                    warn!(room_id = %room_id, "Dropping undecodable tube state: {}", e);
                    None
                }
            })
            .collect()
    }

    pub async fn delete_tube_state(&self, room_id: &str) {
        self.hash_del(TUBE_STATES, room_id).await;
        self.hash_del(TUBE_IDLE, room_id).await;
    }

    pub async fn mark_tube_idle(&self, room_id: &str, since_ms: i64) {
        self.hash_set(TUBE_IDLE, room_id, &since_ms.to_string()).await;
    }

    pub async fn clear_tube_idle(&self, room_id: &str) {
        self.hash_del(TUBE_IDLE, room_id).await;
    }

    /// Delete tube states of rooms idle for longer than `grace`.
    /// Returns the pruned room ids.
    pub async fn prune_idle_tube_states(&self, grace: Duration, now_ms: i64) -> Vec<String> {
        let cutoff = now_ms - grace.as_millis() as i64;
        let mut pruned = Vec::new();
        for (room_id, since) in self.hash_get_all(TUBE_IDLE).await {
            let stale = since.parse::<i64>().map_or(true, |since| since <= cutoff);
            if stale {
                self.delete_tube_state(&room_id).await;
                pruned.push(room_id);
            }
        }
        pruned
    }

    // -- Moderation --

    pub async fn add_shadow_muted(&self, user_key: &str) {
        self.set_add(SHADOW_MUTED, user_key).await;
    }

    pub async fn remove_shadow_muted(&self, user_key: &str) {
        self.set_remove(SHADOW_MUTED, user_key).await;
    }

    pub async fn is_shadow_muted(&self, user_key: &str) -> bool {
        self.set_is_member(SHADOW_MUTED, user_key).await
    }

    /// Mark a user's messages as wiped at `now_ms`. Each mark lapses on its
    /// own after the retention window.
    pub async fn wipe_user_messages(&self, user_key: &str, now_ms: i64) {
        self.scored_add(WIPED_USERS, &[user_key.to_string()], now_ms, retention_floor(now_ms))
            .await;
    }

    pub async fn add_wiped_messages(&self, message_ids: &[String], now_ms: i64) {
        if message_ids.is_empty() {
            return;
        }
        self.scored_add(WIPED_MESSAGES, message_ids, now_ms, retention_floor(now_ms))
            .await;
    }

    /// Ids wiped within the retention window ending at `now_ms`.
    pub async fn wiped_message_ids(&self, now_ms: i64) -> HashSet<String> {
        self.scored_from(WIPED_MESSAGES, retention_floor(now_ms)).await
    }

    pub async fn set_cam_ban(&self, user_key: &str, until_ms: i64) {
        self.hash_set(CAM_BANS, user_key, &until_ms.to_string()).await;
    }

    /// When the user's camera ban lifts, if one is active at `now_ms`.
    /// Lapsed bans are removed on sight.
    pub async fn cam_ban_until(&self, user_key: &str, now_ms: i64) -> Option<i64> {
        let until = self.hash_get(CAM_BANS, user_key).await?.parse::<i64>().ok();
        match until {
            Some(until) if until > now_ms => Some(until),
            _ => {
                self.hash_del(CAM_BANS, user_key).await;
                None
            }
        }
    }

    // -- Rate limiting --

    /// Count a new IRC connection attempt for `user_id`. True while the user
    /// is within the per-minute ceiling.
    pub async fn check_irc_limit(&self, user_id: &str) -> bool {
        let count = self
            .string_incr_with_expiry(&irc_limit_key(user_id), IRC_LIMIT_WINDOW)
            .await;
        count <= IRC_LIMIT_MAX
    }
}
