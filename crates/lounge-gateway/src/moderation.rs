use std::collections::HashSet;

use thiserror::Error;
use tracing::info;

use lounge_store::SharedStateStore;
use lounge_types::models::{ChatMessage, User};

use crate::registry::StoredMessage;

/// Longest camera ban a moderator can hand out.
pub const MAX_CAM_BAN_MINUTES: u32 = 24 * 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModerationError {
    #[error("only moderators can do that")]
    NotModerator,

    #[error("no such user in this room")]
    UnknownTarget,

    #[error("ban length must be between 1 and {max} minutes, got {0}", max = MAX_CAM_BAN_MINUTES)]
    InvalidBanLength(u32),
}

/// Who is looking at a message list.
#[derive(Debug, Clone, Copy)]
pub struct Viewer<'a> {
    pub is_moderator: bool,
    pub moderation_key: &'a str,
}

impl<'a> Viewer<'a> {
    pub fn of(user: &'a User) -> Self {
        Self {
            is_moderator: user.is_moderator(),
            moderation_key: user.moderation_key(),
        }
    }
}

/// Whether `viewer` may see `stored`. Moderators see everything; authors
/// always see their own shadowed messages.
pub fn is_visible(stored: &StoredMessage, wiped: &HashSet<String>, viewer: Viewer<'_>) -> bool {
    if viewer.is_moderator {
        return true;
    }
    if wiped.contains(&stored.message.id) {
        return false;
    }
    !stored.shadowed || stored.author_key.as_deref() == Some(viewer.moderation_key)
}

/// Shadow mutes, message wipes and camera bans, kept in the shared store.
#[derive(Clone)]
pub struct ModerationLedger {
    store: SharedStateStore,
}

impl ModerationLedger {
    pub fn new(store: SharedStateStore) -> Self {
        Self { store }
    }

    fn require_moderator(actor: &User) -> Result<(), ModerationError> {
        if actor.is_moderator() {
            Ok(())
        } else {
            Err(ModerationError::NotModerator)
        }
    }

    pub async fn shadow_mute(
        &self,
        actor: &User,
        target_user_id: Option<&str>,
        target_user_name: &str,
        mute: bool,
    ) -> Result<(), ModerationError> {
        Self::require_moderator(actor)?;
        let key = target_user_id.unwrap_or(target_user_name);
        if mute {
            self.store.add_shadow_muted(key).await;
        } else {
            self.store.remove_shadow_muted(key).await;
        }
        info!(moderator = %actor.name, target = key, mute, "Shadow mute updated");
        Ok(())
    }

    /// Whether a message from `author` should be shadowed at fan-out.
    pub async fn is_shadowed(&self, author: &User) -> bool {
        self.store.is_shadow_muted(author.moderation_key()).await
    }

    /// Wipe every message of the target found in `history`. Returns the ids
    /// that were wiped.
    pub async fn wipe_messages<'a, I>(
        &self,
        actor: &User,
        target_user_id: Option<&str>,
        target_user_name: &str,
        history: I,
        now_ms: i64,
    ) -> Result<Vec<String>, ModerationError>
    where
        I: IntoIterator<Item = &'a ChatMessage>,
    {
        Self::require_moderator(actor)?;
        let ids: Vec<String> = history
            .into_iter()
            .filter(|m| m.is_from(target_user_id, target_user_name))
            .map(|m| m.id.clone())
            .collect();

        self.store.add_wiped_messages(&ids, now_ms).await;
        self.store
            .wipe_user_messages(target_user_id.unwrap_or(target_user_name), now_ms)
            .await;
        info!(
            moderator = %actor.name,
            target = target_user_name,
            count = ids.len(),
            "Messages wiped"
        );
        Ok(ids)
    }

    /// Message ids wiped within the last day.
    pub async fn wiped_ids(&self, now_ms: i64) -> HashSet<String> {
        self.store.wiped_message_ids(now_ms).await
    }

    /// Ban the target's camera for `minutes`. Returns the lift time in ms.
    pub async fn force_cam_down(
        &self,
        actor: &User,
        target: &User,
        minutes: u32,
        now_ms: i64,
    ) -> Result<i64, ModerationError> {
        Self::require_moderator(actor)?;
        if minutes == 0 || minutes > MAX_CAM_BAN_MINUTES {
            return Err(ModerationError::InvalidBanLength(minutes));
        }
        let until = now_ms + i64::from(minutes) * 60_000;
        self.store.set_cam_ban(target.moderation_key(), until).await;
        info!(
            moderator = %actor.name,
            target = %target.name,
            minutes,
            "Camera forced down"
        );
        Ok(until)
    }

    /// Whole minutes left on the user's camera ban, rounded up.
    pub async fn cam_ban_remaining(&self, user: &User, now_ms: i64) -> Option<u32> {
        let until = self.store.cam_ban_until(user.moderation_key(), now_ms).await?;
        let minutes = (until - now_ms + 59_999) / 60_000;
        Some(minutes.clamp(1, i64::from(MAX_CAM_BAN_MINUTES)) as u32)
    }
}
