use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::{ChatMessage, Peer, ReactionMap, TubeSnapshot, User};

/// Commands sent FROM client TO server over WebSocket.
///
/// Each category is its own closed enum; the wire shape is
/// `{"type": "...", "data": {...}}` for all of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientCommand {
    Room(RoomCommand),
    Tube(TubeEvent),
    Reaction(ReactionEvent),
    Moderation(ModerationEvent),
    Irc(IrcCommand),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RoomCommand {
    /// Join (or re-join after a reconnect) a room.
    #[serde(rename = "join-room", rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        user: User,
        #[serde(default)]
        previous_socket_id: Option<String>,
    },

    #[serde(rename = "leave-room")]
    LeaveRoom,

    /// Post a chat message to the current room
    #[serde(rename = "chat-message")]
    ChatMessage { text: String },

    /// Toggle webcam / microphone presence
    #[serde(rename = "media-state", rename_all = "camelCase")]
    MediaState {
        video_enabled: bool,
        audio_enabled: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TubeEvent {
    /// Load a new video. An empty or missing id ejects the current one.
    #[serde(rename = "tube:load", rename_all = "camelCase")]
    Load {
        #[serde(default)]
        video_id: Option<String>,
        #[serde(default)]
        title: Option<String>,
    },

    #[serde(rename = "tube:play")]
    Play {
        #[serde(default)]
        timestamp: Option<f64>,
    },

    #[serde(rename = "tube:pause")]
    Pause {
        #[serde(default)]
        timestamp: Option<f64>,
    },

    #[serde(rename = "tube:seek")]
    Seek { timestamp: f64 },

    /// Owner heartbeat while playing
    #[serde(rename = "tube:progress")]
    Progress { timestamp: f64 },

    #[serde(rename = "tube:ended")]
    Ended,

    #[serde(rename = "tube:queue", rename_all = "camelCase")]
    Queue {
        video_id: String,
        #[serde(default)]
        title: Option<String>,
    },

    #[serde(rename = "tube:request-state")]
    RequestState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ReactionEvent {
    #[serde(rename = "message-react", rename_all = "camelCase")]
    React { message_id: String, emoji: String },

    #[serde(rename = "message-unreact", rename_all = "camelCase")]
    Unreact { message_id: String, emoji: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ModerationEvent {
    #[serde(rename = "mod-shadow-mute", rename_all = "camelCase")]
    ShadowMute {
        #[serde(default)]
        target_user_id: Option<String>,
        target_user_name: String,
        mute: bool,
    },

    #[serde(rename = "mod-wipe-messages", rename_all = "camelCase")]
    WipeMessages {
        #[serde(default)]
        target_user_id: Option<String>,
        target_user_name: String,
    },

    #[serde(rename = "mod-force-cam-down", rename_all = "camelCase")]
    ForceCamDown {
        target_socket_id: String,
        ban_minutes: u32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum IrcCommand {
    /// Open a private bridge for this connection
    #[serde(rename = "irc-connect")]
    Connect {
        nick: String,
        #[serde(default)]
        channel: Option<String>,
    },

    /// Plain text goes to the current channel; slash-prefixed text is a command
    #[serde(rename = "irc-input")]
    Input { text: String },

    #[serde(rename = "irc-disconnect")]
    Disconnect,
}

/// Events sent FROM server TO client over WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    /// Sent to the joining connection only
    #[serde(rename = "room-joined", rename_all = "camelCase")]
    RoomJoined {
        room_id: String,
        socket_id: String,
        users: Vec<Peer>,
        history: Vec<ChatMessage>,
        /// Message id -> reactions, for replayed messages that have any
        reactions: BTreeMap<String, ReactionMap>,
        tube: TubeSnapshot,
    },

    #[serde(rename = "user-joined", rename_all = "camelCase")]
    UserJoined { socket_id: String, user: User },

    #[serde(rename = "user-updated", rename_all = "camelCase")]
    UserUpdated { socket_id: String, user: User },

    #[serde(rename = "user-left", rename_all = "camelCase")]
    UserLeft { socket_id: String },

    #[serde(rename = "chat-message")]
    ChatMessage(ChatMessage),

    #[serde(rename = "tube:state")]
    TubeState(TubeSnapshot),

    /// Full reaction map of one message, never a delta
    #[serde(rename = "message-reactions-update", rename_all = "camelCase")]
    MessageReactionsUpdate {
        message_id: String,
        reactions: ReactionMap,
    },

    #[serde(rename = "mod-messages-wiped", rename_all = "camelCase")]
    ModMessagesWiped {
        target_user_id: Option<String>,
        message_ids: Vec<String>,
    },

    #[serde(rename = "mod-action-result")]
    ModActionResult {
        action: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "force-cam-down", rename_all = "camelCase")]
    ForceCamDown { ban_minutes: u32, reason: String },

    #[serde(rename = "irc-connected")]
    IrcConnected {
        nick: String,
        channel: Option<String>,
    },

    #[serde(rename = "irc-disconnected")]
    IrcDisconnected { reason: Option<String> },

    #[serde(rename = "irc-user-joined")]
    IrcUserJoined { channel: String, nick: String },

    #[serde(rename = "irc-user-left")]
    IrcUserLeft {
        channel: Option<String>,
        nick: String,
        reason: Option<String>,
    },

    #[serde(rename = "irc-nick-change", rename_all = "camelCase")]
    IrcNickChange { old_nick: String, new_nick: String },

    #[serde(rename = "irc-userlist")]
    IrcUserlist { channel: String, users: Vec<String> },

    #[serde(rename = "irc-command-result")]
    IrcCommandResult { ok: bool, message: String },

    #[serde(rename = "irc-error")]
    IrcError { message: String },

    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerEvent {
    /// Wire name of the event, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RoomJoined { .. } => "room-joined",
            Self::UserJoined { .. } => "user-joined",
            Self::UserUpdated { .. } => "user-updated",
            Self::UserLeft { .. } => "user-left",
            Self::ChatMessage(_) => "chat-message",
            Self::TubeState(_) => "tube:state",
            Self::MessageReactionsUpdate { .. } => "message-reactions-update",
            Self::ModMessagesWiped { .. } => "mod-messages-wiped",
            Self::ModActionResult { .. } => "mod-action-result",
            Self::ForceCamDown { .. } => "force-cam-down",
            Self::IrcConnected { .. } => "irc-connected",
            Self::IrcDisconnected { .. } => "irc-disconnected",
            Self::IrcUserJoined { .. } => "irc-user-joined",
            Self::IrcUserLeft { .. } => "irc-user-left",
            Self::IrcNickChange { .. } => "irc-nick-change",
            Self::IrcUserlist { .. } => "irc-userlist",
            Self::IrcCommandResult { .. } => "irc-command-result",
            Self::IrcError { .. } => "irc-error",
            Self::Error { .. } => "error",
        }
    }
}
