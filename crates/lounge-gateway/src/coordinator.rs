//! The router behind every socket: one entry point per inbound command,
//! dispatching to the room registry, tube, moderation, reactions and IRC.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use lounge_store::queries::ROOM_EVENTS_TOPIC;
use lounge_types::events::{
    ClientCommand, IrcCommand, ModerationEvent, ReactionEvent, RoomCommand, ServerEvent, TubeEvent,
};
use lounge_types::models::{ChatMessage, MessageSource, User, now_ms};

use crate::dispatcher::{Audience, Dispatcher};
use crate::irc::IrcBridgeManager;
use crate::moderation::{ModerationError, ModerationLedger, Viewer, is_visible};
use crate::reactions::{MessageReactionAggregator, valid_emoji};
use crate::registry::{Departure, StoredMessage};
use crate::tube::TubeSyncCoordinator;

/// Longest chat message accepted, in characters.
pub const MAX_CHAT_CHARS: usize = 2000;

const CAM_BAN_REASON: &str = "Your camera was turned off by a moderator";

#[derive(Clone)]
pub struct RoomCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    dispatcher: Dispatcher,
    tube: TubeSyncCoordinator,
    moderation: ModerationLedger,
    reactions: MessageReactionAggregator,
    irc: IrcBridgeManager,
}

impl RoomCoordinator {
    pub fn new(dispatcher: Dispatcher, irc: IrcBridgeManager) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                tube: TubeSyncCoordinator::new(dispatcher.clone()),
                moderation: ModerationLedger::new(dispatcher.store().clone()),
                reactions: MessageReactionAggregator::new(),
                irc,
                dispatcher,
            }),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn tube(&self) -> &TubeSyncCoordinator {
        &self.inner.tube
    }

    pub fn irc(&self) -> &IrcBridgeManager {
        &self.inner.irc
    }

    /// Open a socket. Returns its id and the receiver of its outbound events.
    pub async fn connect(&self) -> (String, mpsc::UnboundedReceiver<ServerEvent>) {
        self.inner.dispatcher.register_socket().await
    }

    /// Tear down everything a closed socket held.
    pub async fn disconnect(&self, socket_id: &str) {
        self.inner.irc.disconnect(socket_id, Some("Connection closed")).await;
        let departure = self
            .inner
            .dispatcher
            .registry()
            .write()
            .await
            .leave(socket_id, Instant::now());
        if let Some(departure) = departure {
            self.departed(socket_id, departure).await;
        }
        self.inner.dispatcher.unregister_socket(socket_id).await;
    }

    async fn reply(&self, socket_id: &str, event: ServerEvent) {
        self.inner.dispatcher.send_to_socket(socket_id, event).await;
    }

    async fn reply_error(&self, socket_id: &str, message: &str) {
        self.reply(
            socket_id,
            ServerEvent::Error {
                message: message.to_string(),
            },
        )
        .await;
    }

    /// Room and user of a socket that has joined a room.
    async fn member(&self, socket_id: &str) -> Option<(String, User)> {
        let registry = self.inner.dispatcher.registry().read().await;
        let room_id = registry.room_of(socket_id)?.to_string();
        let user = registry.user(socket_id)?.clone();
        Some((room_id, user))
    }

    pub async fn handle(&self, socket_id: &str, command: ClientCommand) {
        match command {
            ClientCommand::Room(command) => self.handle_room(socket_id, command).await,
            ClientCommand::Tube(event) => self.handle_tube(socket_id, event).await,
            ClientCommand::Reaction(event) => self.handle_reaction(socket_id, event).await,
            ClientCommand::Moderation(event) => self.handle_moderation(socket_id, event).await,
            ClientCommand::Irc(command) => self.handle_irc(socket_id, command).await,
        }
    }

    async fn handle_room(&self, socket_id: &str, command: RoomCommand) {
        match command {
            RoomCommand::JoinRoom {
                room_id,
                user,
                previous_socket_id,
            } => {
                self.join(socket_id, room_id.trim(), user, previous_socket_id.as_deref())
                    .await
            }
            RoomCommand::LeaveRoom => {
                let departure = self
                    .inner
                    .dispatcher
                    .registry()
                    .write()
                    .await
                    .leave(socket_id, Instant::now());
                if let Some(departure) = departure {
                    self.departed(socket_id, departure).await;
                }
            }
            RoomCommand::ChatMessage { text } => self.chat(socket_id, &text).await,
            RoomCommand::MediaState {
                video_enabled,
                audio_enabled,
            } => self.media_state(socket_id, video_enabled, audio_enabled).await,
        }
    }

    async fn join(&self, socket_id: &str, room_id: &str, mut user: User, previous_socket_id: Option<&str>) {
        user.name = user.name.trim().to_string();
        if room_id.is_empty() || user.name.is_empty() {
            self.reply_error(socket_id, "room and name are required").await;
            return;
        }

        let dispatcher = &self.inner.dispatcher;
        let reclaimed = match previous_socket_id {
            Some(previous) => dispatcher
                .registry()
                .write()
                .await
                .reclaim_identity(previous, Instant::now())
                .filter(|cached| cached.room_id == room_id)
                .map(|cached| (previous.to_string(), cached.user)),
            None => None,
        };
        if let Some((previous, cached)) = &reclaimed {
            info!(socket_id, previous, room_id, "Connection resumed previous identity");
            user = cached.clone();
        }

        if user.video_enabled {
            if let Some(minutes) = self.inner.moderation.cam_ban_remaining(&user, now_ms()).await {
                user.video_enabled = false;
                self.reply(
                    socket_id,
                    ServerEvent::ForceCamDown {
                        ban_minutes: minutes,
                        reason: CAM_BAN_REASON.to_string(),
                    },
                )
                .await;
            }
        }

        let (already_here, moved_from) = {
            let mut registry = dispatcher.registry().write().await;
            let already_here = registry.room_of(socket_id) == Some(room_id);
            (already_here, registry.join(room_id, socket_id, user.clone()))
        };
        if let Some(departure) = moved_from {
            self.departed(socket_id, departure).await;
        }

        if already_here {
            dispatcher
                .broadcast_room(
                    room_id,
                    ServerEvent::UserUpdated {
                        socket_id: socket_id.to_string(),
                        user,
                    },
                    Audience::Everyone,
                )
                .await;
            return;
        }

        self.inner.tube.member_joined(room_id).await;
        if let Some((previous, _)) = &reclaimed {
            self.inner.tube.transfer_owner(room_id, previous, socket_id).await;
        }

        let wiped = self.inner.moderation.wiped_ids(now_ms()).await;
        let (users, history): (_, Vec<ChatMessage>) = {
            let registry = dispatcher.registry().read().await;
            let viewer = Viewer::of(&user);
            let history = registry
                .room(room_id)
                .map(|room| {
                    room.history()
                        .filter(|stored| is_visible(stored, &wiped, viewer))
                        .map(|stored| stored.message.clone())
                        .collect()
                })
                .unwrap_or_default();
            (registry.peers(room_id), history)
        };
        let reactions = history
            .iter()
            .filter_map(|message| {
                let map = self.inner.reactions.reactions(room_id, &message.id);
                (!map.is_empty()).then(|| (message.id.clone(), map))
            })
            .collect();
        let tube = self.inner.tube.snapshot(room_id).await;

        info!(socket_id, room_id, name = %user.name, "Joined room");
        self.reply(
            socket_id,
            ServerEvent::RoomJoined {
                room_id: room_id.to_string(),
                socket_id: socket_id.to_string(),
                users,
                history,
                reactions,
                tube,
            },
        )
        .await;
        dispatcher
            .broadcast_room(
                room_id,
                ServerEvent::UserJoined {
                    socket_id: socket_id.to_string(),
                    user,
                },
                Audience::Except(socket_id.to_string()),
            )
            .await;
    }

    /// Follow-up after a connection left a room.
    async fn departed(&self, socket_id: &str, departure: Departure) {
        let Departure {
            room_id,
            user,
            room_emptied,
        } = departure;
        info!(socket_id, room_id, name = %user.name, room_emptied, "Left room");

        self.inner
            .dispatcher
            .broadcast_room(
                &room_id,
                ServerEvent::UserLeft {
                    socket_id: socket_id.to_string(),
                },
                Audience::Except(socket_id.to_string()),
            )
            .await;
        self.inner.tube.member_left(&room_id, socket_id, room_emptied).await;
        if room_emptied {
            self.inner.reactions.clear_room(&room_id);
        }
    }

    async fn chat(&self, socket_id: &str, text: &str) {
        let Some((room_id, user)) = self.member(socket_id).await else {
            self.reply_error(socket_id, "join a room first").await;
            return;
        };
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if text.starts_with('/') {
            let irc = &self.inner.irc;
            if irc.has_private_bridge(socket_id).await {
                irc.handle_input(socket_id, text).await;
                return;
            }
            if irc.relays_room(&room_id).await {
                self.reply(
                    socket_id,
                    ServerEvent::IrcError {
                        message: "not connected to IRC".to_string(),
                    },
                )
                .await;
                return;
            }
        }
        let text: String = text.chars().take(MAX_CHAT_CHARS).collect();

        let shadowed = self.inner.moderation.is_shadowed(&user).await;
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.clone(),
            text,
            sender: user.name.clone(),
            sender_id: user.id.clone(),
            sender_color: None,
            timestamp: now_ms(),
            source: MessageSource::Native,
            channel: None,
        };

        {
            let mut registry = self.inner.dispatcher.registry().write().await;
            if let Some(room) = registry.room_mut(&room_id) {
                room.push_message(StoredMessage {
                    message: message.clone(),
                    shadowed,
                    author_key: Some(user.moderation_key().to_string()),
                });
                self.inner
                    .reactions
                    .retain_messages(&room_id, |id| room.has_message(id));
            }
        }

        let audience = if shadowed {
            debug!(socket_id, room_id, "Shadow-muted message limited to moderators");
            Audience::ModeratorsAnd(socket_id.to_string())
        } else {
            Audience::Everyone
        };
        let relayed = message.text.clone();
        self.inner
            .dispatcher
            .broadcast_room(&room_id, ServerEvent::ChatMessage(message), audience)
            .await;

        if !shadowed {
            self.inner.irc.relay_outbound(&room_id, &relayed).await;
        }
    }

    async fn media_state(&self, socket_id: &str, mut video_enabled: bool, audio_enabled: bool) {
        let Some((room_id, user)) = self.member(socket_id).await else {
            return;
        };
        if video_enabled {
            if let Some(minutes) = self.inner.moderation.cam_ban_remaining(&user, now_ms()).await {
                video_enabled = false;
                self.reply(
                    socket_id,
                    ServerEvent::ForceCamDown {
                        ban_minutes: minutes,
                        reason: CAM_BAN_REASON.to_string(),
                    },
                )
                .await;
            }
        }

        let updated = {
            let mut registry = self.inner.dispatcher.registry().write().await;
            registry.user_mut(socket_id).map(|user| {
                user.video_enabled = video_enabled;
                user.audio_enabled = audio_enabled;
                user.clone()
            })
        };
        if let Some(user) = updated {
            self.inner
                .dispatcher
                .broadcast_room(
                    &room_id,
                    ServerEvent::UserUpdated {
                        socket_id: socket_id.to_string(),
                        user,
                    },
                    Audience::Everyone,
                )
                .await;
        }
    }

    async fn handle_tube(&self, socket_id: &str, event: TubeEvent) {
        let room_id = {
            let registry = self.inner.dispatcher.registry().read().await;
            registry.room_of(socket_id).map(String::from)
        };
        match room_id {
            Some(room_id) => {
                self.inner.tube.handle(&room_id, socket_id, event).await;
            }
            None => self.reply_error(socket_id, "join a room first").await,
        }
    }

    async fn handle_reaction(&self, socket_id: &str, event: ReactionEvent) {
        let Some((room_id, user)) = self.member(socket_id).await else {
            self.reply_error(socket_id, "join a room first").await;
            return;
        };
        let (message_id, emoji, add) = match event {
            ReactionEvent::React { message_id, emoji } => (message_id, emoji, true),
            ReactionEvent::Unreact { message_id, emoji } => (message_id, emoji, false),
        };
        if !valid_emoji(&emoji) {
            self.reply_error(socket_id, "invalid emoji").await;
            return;
        }
        let known = {
            let registry = self.inner.dispatcher.registry().read().await;
            registry
                .room(&room_id)
                .is_some_and(|room| room.has_message(&message_id))
        };
        if !known {
            self.reply_error(socket_id, "unknown message").await;
            return;
        }

        let reactor = user.moderation_key();
        let reactions = if add {
            self.inner.reactions.react(&room_id, &message_id, &emoji, reactor)
        } else {
            self.inner.reactions.unreact(&room_id, &message_id, &emoji, reactor)
        };
        self.inner
            .dispatcher
            .broadcast_room(
                &room_id,
                ServerEvent::MessageReactionsUpdate {
                    message_id,
                    reactions,
                },
                Audience::Everyone,
            )
            .await;
    }

    async fn handle_moderation(&self, socket_id: &str, event: ModerationEvent) {
        let Some((room_id, actor)) = self.member(socket_id).await else {
            self.reply_error(socket_id, "join a room first").await;
            return;
        };
        let moderation = &self.inner.moderation;

        let (action, result) = match event {
            ModerationEvent::ShadowMute {
                target_user_id,
                target_user_name,
                mute,
            } => {
                let result = moderation
                    .shadow_mute(&actor, target_user_id.as_deref(), &target_user_name, mute)
                    .await;
                ("shadow-mute", result)
            }

            ModerationEvent::WipeMessages {
                target_user_id,
                target_user_name,
            } => {
                let history: Vec<ChatMessage> = {
                    let registry = self.inner.dispatcher.registry().read().await;
                    registry
                        .room(&room_id)
                        .map(|room| room.history().map(|s| s.message.clone()).collect())
                        .unwrap_or_default()
                };
                let result = moderation
                    .wipe_messages(
                        &actor,
                        target_user_id.as_deref(),
                        &target_user_name,
                        &history,
                        now_ms(),
                    )
                    .await;
                let result = match result {
                    Ok(message_ids) => {
                        self.inner
                            .dispatcher
                            .broadcast_room(
                                &room_id,
                                ServerEvent::ModMessagesWiped {
                                    target_user_id,
                                    message_ids,
                                },
                                Audience::Everyone,
                            )
                            .await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                ("wipe-messages", result)
            }

            ModerationEvent::ForceCamDown {
                target_socket_id,
                ban_minutes,
            } => {
                let result = self
                    .force_cam_down(&room_id, &actor, &target_socket_id, ban_minutes)
                    .await;
                ("force-cam-down", result)
            }
        };

        if let Err(e) = &result {
            warn!(socket_id, action, "Moderation action refused: {}", e);
        }
        self.reply(
            socket_id,
            ServerEvent::ModActionResult {
                action: action.to_string(),
                ok: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
            },
        )
        .await;
    }

    async fn force_cam_down(
        &self,
        room_id: &str,
        actor: &User,
        target_socket_id: &str,
        ban_minutes: u32,
    ) -> Result<(), ModerationError> {
        let dispatcher = &self.inner.dispatcher;
        let target = {
            let registry = dispatcher.registry().read().await;
            match registry.room_of(target_socket_id) {
                Some(room) if room == room_id => registry.user(target_socket_id).cloned(),
                _ => None,
            }
        };
        if !actor.is_moderator() {
            return Err(ModerationError::NotModerator);
        }
        let target = target.ok_or(ModerationError::UnknownTarget)?;

        self.inner
            .moderation
            .force_cam_down(actor, &target, ban_minutes, now_ms())
            .await?;

        self.reply(
            target_socket_id,
            ServerEvent::ForceCamDown {
                ban_minutes,
                reason: CAM_BAN_REASON.to_string(),
            },
        )
        .await;

        let updated = {
            let mut registry = dispatcher.registry().write().await;
            registry.user_mut(target_socket_id).map(|user| {
                user.video_enabled = false;
                user.clone()
            })
        };
        if let Some(user) = updated {
            dispatcher
                .broadcast_room(
                    room_id,
                    ServerEvent::UserUpdated {
                        socket_id: target_socket_id.to_string(),
                        user,
                    },
                    Audience::Everyone,
                )
                .await;
        }
        Ok(())
    }

    async fn handle_irc(&self, socket_id: &str, command: IrcCommand) {
        let irc = &self.inner.irc;
        match command {
            IrcCommand::Connect { nick, channel } => {
                irc.connect_private(socket_id, &nick, channel.as_deref()).await
            }
            IrcCommand::Input { text } => irc.handle_input(socket_id, &text).await,
            IrcCommand::Disconnect => irc.disconnect(socket_id, None).await,
        }
    }

    /// Rebroadcast room events published by other instances to local members.
    /// Runs until the store's subscription ends.
    pub async fn run_bus(self) {
        let dispatcher = &self.inner.dispatcher;
        let mut payloads = dispatcher.store().subscribe(ROOM_EVENTS_TOPIC).await;
        info!(instance = dispatcher.instance_id(), "Listening for room events from other instances");

        while let Some(payload) = payloads.recv().await {
            let Some(envelope) = dispatcher.accept_envelope(&payload) else {
                continue;
            };
            let room_id = envelope.room_id.as_str();

            match &envelope.event {
                ServerEvent::TubeState(snapshot) => {
                    self.inner.tube.apply_remote(room_id, snapshot).await;
                }
                ServerEvent::ChatMessage(message) => {
                    let mut registry = dispatcher.registry().write().await;
                    if let Some(room) = registry.room_mut(room_id) {
                        room.push_message(StoredMessage {
                            message: message.clone(),
                            shadowed: envelope.audience != Audience::Everyone,
                            author_key: None,
                        });
                    }
                }
                ServerEvent::MessageReactionsUpdate {
                    message_id,
                    reactions,
                } => {
                    self.inner
                        .reactions
                        .replace(room_id, message_id, reactions.clone());
                }
                _ => {}
            }

            dispatcher
                .deliver_local(room_id, &envelope.event, &envelope.audience)
                .await;
        }
        error!("Room event subscription ended, cross-instance events will be missed");
    }

    /// Periodic housekeeping: expired reconnect identities, tube states of
    /// rooms idle past `tube_grace`, and lapsed in-memory keys.
    pub async fn sweep(&self, tube_grace: Duration) {
        let dispatcher = &self.inner.dispatcher;
        let identities = dispatcher
            .registry()
            .write()
            .await
            .prune_identities(Instant::now());

        let pruned = dispatcher
            .store()
            .prune_idle_tube_states(tube_grace, now_ms())
            .await;
        self.inner.tube.forget(&pruned).await;

        let keys = dispatcher.store().sweep_local();
        if identities > 0 || !pruned.is_empty() || keys > 0 {
            info!(
                identities,
                tube_states = pruned.len(),
                keys,
                "Cleanup pass"
            );
        }
    }
}
