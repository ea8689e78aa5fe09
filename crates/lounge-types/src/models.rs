use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Guest,
    Member,
    Moderator,
    Admin,
}

impl Role {
    pub fn is_moderator(self) -> bool {
        matches!(self, Role::Moderator | Role::Admin)
    }
}

/// Identity snapshot carried by a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Stable account id. Guests have none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub video_enabled: bool,
    #[serde(default)]
    pub audio_enabled: bool,
}

impl User {
    pub fn guest(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            role: Role::Guest,
            avatar: None,
            video_enabled: false,
            audio_enabled: false,
        }
    }

    /// Key used for moderation flags: the stable id, or the display name
    /// when no stable id exists.
    pub fn moderation_key(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.name)
    }

    pub fn is_moderator(&self) -> bool {
        self.role.is_moderator()
    }
}

/// A connection and the user behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub socket_id: String,
    pub user: User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSource {
    #[default]
    Native,
    Irc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub room_id: String,
    pub text: String,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_color: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub source: MessageSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl ChatMessage {
    /// True when this message was authored by the given moderation key
    /// (stable id, or display name for id-less senders).
    pub fn is_from(&self, user_id: Option<&str>, user_name: &str) -> bool {
        match (user_id, self.sender_id.as_deref()) {
            (Some(target), Some(sender)) => target == sender,
            _ => self.sender == user_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedVideo {
    pub video_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TubePhase {
    Empty,
    Paused,
    Playing,
}

/// Authoritative playback state of one room.
///
/// `timestamp` is the video position at `last_update`. While `is_playing`
/// the live position advances with wall-clock time from that anchor.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TubeState {
    pub video_id: Option<String>,
    /// Title of the current video, when whoever loaded it gave one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_by: Option<String>,
    pub is_playing: bool,
    /// Seconds into the video.
    pub timestamp: f64,
    /// Wall-clock ms of the last authoritative change.
    pub last_update: i64,
    pub owner_id: Option<String>,
    #[serde(default)]
    pub queue: Vec<QueuedVideo>,
    #[serde(default)]
    pub history: Vec<QueuedVideo>,
}

impl TubeState {
    pub fn phase(&self) -> TubePhase {
        match (&self.video_id, self.is_playing) {
            (None, _) => TubePhase::Empty,
            (Some(_), false) => TubePhase::Paused,
            (Some(_), true) => TubePhase::Playing,
        }
    }

    /// Position in seconds at wall-clock `now_ms`, extrapolated while playing.
    /// Clock skew never moves the position backwards past the anchor.
    pub fn position_at(&self, now_ms: i64) -> f64 {
        let base = self.timestamp.max(0.0);
        if !self.is_playing {
            return base;
        }
        let elapsed_ms = (now_ms - self.last_update).max(0);
        base + elapsed_ms as f64 / 1000.0
    }

    pub fn snapshot(&self, server_time: i64) -> TubeSnapshot {
        TubeSnapshot {
            state: self.clone(),
            server_time,
        }
    }
}

/// A `TubeState` stamped with the server clock at broadcast time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TubeSnapshot {
    #[serde(flatten)]
    pub state: TubeState,
    pub server_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReactionGroup {
    pub count: usize,
    pub reactors: BTreeSet<String>,
}

/// emoji -> reaction group for a single message.
pub type ReactionMap = BTreeMap<String, ReactionGroup>;
