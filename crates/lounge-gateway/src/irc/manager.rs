//! Owns every IRC bridge: one optional shared relay that mirrors mapped
//! channels into rooms, plus private bridges opened by individual sockets.
//!
//! Every new connection, shared or private, is started through the
//! [`AdmissionGovernor`]. Private connections are additionally limited per
//! user by the shared store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use lounge_types::events::ServerEvent;
use lounge_types::models::{ChatMessage, MessageSource, now_ms};

use crate::dispatcher::{Audience, Dispatcher};
use crate::registry::StoredMessage;

use super::client::BridgeClient;
use super::color::nick_color;
use super::commands::{self, CommandResult, SlashCommand};
use super::governor::AdmissionGovernor;
use super::protocol::{self, MAX_MESSAGE_BYTES, is_valid_nick};
use super::session::{BridgeEvent, BridgeSession, IrcMessage, MAX_NICK_LEN, SessionConfig};

/// Default delay before the shared relay is queued again after losing its
/// connection.
pub const RELAY_RECONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct IrcConfig {
    pub server: String,
    pub port: u16,
    /// Nick of the shared relay
    pub relay_nick: String,
    pub default_channel: String,
    pub default_room: String,
    /// Further `(channel, room)` pairs the shared relay joins once registered
    pub extra_channels: Vec<(String, String)>,
    pub reconnect_delay: Duration,
}

impl IrcConfig {
    fn addr(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum BridgeKey {
    Shared,
    Private(String),
}

impl BridgeKey {
    fn label(&self) -> String {
        match self {
            Self::Shared => "shared relay".to_string(),
            Self::Private(socket_id) => format!("private bridge {}", socket_id),
        }
    }
}

struct ActiveBridge {
    /// Distinguishes a bridge from its successor under the same key
    generation: u64,
    client: BridgeClient,
}

#[derive(Clone)]
pub struct IrcBridgeManager {
    inner: Arc<IrcInner>,
}

struct IrcInner {
    config: Option<IrcConfig>,
    dispatcher: Dispatcher,
    governor: AdmissionGovernor,
    bridges: RwLock<HashMap<BridgeKey, ActiveBridge>>,
    /// Keys waiting in the admission queue
    queued: RwLock<HashSet<BridgeKey>>,
    generation: AtomicU64,
}

impl IrcBridgeManager {
    /// `config` of `None` disables IRC; every request then gets an `irc-error`.
    pub fn new(config: Option<IrcConfig>, dispatcher: Dispatcher, governor: AdmissionGovernor) -> Self {
        Self {
            inner: Arc::new(IrcInner {
                config,
                dispatcher,
                governor,
                bridges: RwLock::new(HashMap::new()),
                queued: RwLock::new(HashSet::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.is_some()
    }

    /// Queue the shared relay.
    ///
    /// Boxed because a closed relay queues itself again from inside its own
    /// event loop.
    pub fn start_shared(&self) -> BoxFuture<'static, ()> {
        let manager = self.clone();
        async move {
            let Some(config) = manager.inner.config.clone() else {
                return;
            };
            let session = SessionConfig {
                nick: config.relay_nick.clone(),
                username: "lounge".to_string(),
                realname: "Lounge relay".to_string(),
                default_channel: Some((config.default_channel, config.default_room)),
            };
            manager.enqueue(BridgeKey::Shared, session).await;
        }
        .boxed()
    }

    /// Open a private bridge for `socket_id`.
    pub async fn connect_private(&self, socket_id: &str, nick: &str, channel: Option<&str>) {
        let dispatcher = &self.inner.dispatcher;
        let Some(config) = self.inner.config.clone() else {
            self.send_error(socket_id, "IRC is not available on this server").await;
            return;
        };

        let member = {
            let registry = dispatcher.registry().read().await;
            registry
                .user(socket_id)
                .cloned()
                .zip(registry.room_of(socket_id).map(String::from))
        };
        let Some((user, room_id)) = member else {
            self.send_error(socket_id, "join a room before connecting to IRC").await;
            return;
        };

        let nick = nick.trim();
        if !is_valid_nick(nick, MAX_NICK_LEN) {
            self.send_error(socket_id, &format!("invalid nickname: {}", nick)).await;
            return;
        }

        let key = BridgeKey::Private(socket_id.to_string());
        if self.inner.bridges.read().await.contains_key(&key)
            || self.inner.queued.read().await.contains(&key)
        {
            self.send_error(socket_id, "already connected to IRC").await;
            return;
        }

        if !dispatcher.store().check_irc_limit(user.moderation_key()).await {
            info!(socket_id, user = %user.name, "IRC connection refused by per-user limit");
            self.send_error(socket_id, "too many IRC connections, try again in a minute")
                .await;
            return;
        }

        let channel = channel
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(|c| {
                if protocol::is_channel(c) {
                    c.to_string()
                } else {
                    format!("#{}", c)
                }
            })
            .unwrap_or(config.default_channel);

        let session = SessionConfig {
            nick: nick.to_string(),
            username: "lounge".to_string(),
            realname: format!("Lounge user {}", user.name),
            default_channel: Some((channel, room_id)),
        };
        let ahead = self.enqueue(key, session).await;
        dispatcher
            .send_to_socket(
                socket_id,
                ServerEvent::IrcCommandResult {
                    ok: true,
                    message: format!("connecting as {} ({} ahead in queue)", nick, ahead),
                },
            )
            .await;
    }

    async fn enqueue(&self, key: BridgeKey, session: SessionConfig) -> usize {
        self.inner.queued.write().await.insert(key.clone());
        let manager = self.clone();
        let label = key.label();
        self.inner.governor.enqueue(label, move || {
            tokio::spawn(async move { manager.open(key, session).await });
        })
    }

    /// Called by the governor once the connection is admitted.
    async fn open(&self, key: BridgeKey, session: SessionConfig) {
        let Some(config) = self.inner.config.as_ref() else {
            return;
        };
        if !self.inner.queued.write().await.remove(&key) {
            debug!(label = %key.label(), "Queued connection was cancelled");
            return;
        }
        if let BridgeKey::Private(socket_id) = &key {
            if !self.inner.dispatcher.is_connected(socket_id).await {
                debug!(socket_id, "Socket left before its IRC connection was admitted");
                return;
            }
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let client = BridgeClient::spawn(config.addr(), BridgeSession::new(session), events_tx);
        self.inner
            .bridges
            .write()
            .await
            .insert(key.clone(), ActiveBridge { generation, client });
        info!(label = %key.label(), generation, "IRC bridge starting");

        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                manager.on_event(&key, generation, event).await;
            }
        });
    }

    async fn is_current(&self, key: &BridgeKey, generation: u64) -> bool {
        self.inner
            .bridges
            .read()
            .await
            .get(key)
            .is_some_and(|b| b.generation == generation)
    }

    /// Run `f` against the bridge's session.
    async fn with_session<T>(&self, key: &BridgeKey, f: impl FnOnce(&BridgeSession) -> T) -> Option<T> {
        let bridges = self.inner.bridges.read().await;
        bridges.get(key).map(|b| b.client.with_session(f))
    }

    pub async fn has_private_bridge(&self, socket_id: &str) -> bool {
        self.inner
            .bridges
            .read()
            .await
            .contains_key(&BridgeKey::Private(socket_id.to_string()))
    }

    /// Whether the shared relay maps a channel onto `room_id`.
    pub async fn relays_room(&self, room_id: &str) -> bool {
        self.with_session(&BridgeKey::Shared, |s| s.channel_for_room(room_id).is_some())
            .await
            .unwrap_or(false)
    }

    /// Relay a native chat message, as is, into the channel mapped to `room_id`.
    pub async fn relay_outbound(&self, room_id: &str, text: &str) {
        let bridges = self.inner.bridges.read().await;
        let Some(bridge) = bridges.get(&BridgeKey::Shared) else {
            return;
        };
        let body = protocol::truncate(text, MAX_MESSAGE_BYTES);
        if let Some(line) = bridge.client.with_session(|s| s.outbound_chat(room_id, body)) {
            bridge.client.send_line(line);
        }
    }

    /// Join a channel on the shared relay and map it to `room_id`.
    pub async fn map_channel(&self, channel: &str, room_id: &str) -> bool {
        let bridges = self.inner.bridges.read().await;
        let Some(bridge) = bridges.get(&BridgeKey::Shared) else {
            return false;
        };
        bridge.client.apply(|s| s.join_channel(channel, room_id));
        true
    }

    /// `irc-input`: plain text to the current channel, or a slash command.
    pub async fn handle_input(&self, socket_id: &str, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let key = BridgeKey::Private(socket_id.to_string());
        if !self.inner.bridges.read().await.contains_key(&key) {
            self.send_error(socket_id, "not connected to IRC").await;
            return;
        }

        if text.starts_with('/') {
            let result = match commands::parse(text) {
                Ok(command) => self.run_command(socket_id, &key, command).await,
                Err(e) => CommandResult::from(e),
            };
            self.inner
                .dispatcher
                .send_to_socket(
                    socket_id,
                    ServerEvent::IrcCommandResult {
                        ok: result.ok,
                        message: result.message,
                    },
                )
                .await;
            return;
        }

        let sent = {
            let bridges = self.inner.bridges.read().await;
            bridges.get(&key).and_then(|bridge| {
                let (nick, channel) = bridge
                    .client
                    .with_session(|s| (s.nick().to_string(), s.current_channel().map(String::from)));
                let channel = channel?;
                let text = protocol::truncate(text, MAX_MESSAGE_BYTES);
                bridge.client.send_line(protocol::privmsg(&channel, text));
                Some((nick, channel, text.to_string()))
            })
        };

        match sent {
            // Servers do not echo our own messages back.
            Some((nick, channel, text)) => {
                let message = IrcMessage {
                    target: channel,
                    nick,
                    text,
                    is_action: false,
                };
                self.deliver_message(&key, message).await;
            }
            None => self.send_error(socket_id, "join a channel first").await,
        }
    }

    async fn run_command(&self, socket_id: &str, key: &BridgeKey, command: SlashCommand) -> CommandResult {
        let description = command.describe();

        if let SlashCommand::Quit { message } = &command {
            self.disconnect(socket_id, message.as_deref()).await;
            return CommandResult::ok(description);
        }

        if let SlashCommand::Join { channel } = &command {
            let room_id = self.room_of_socket(socket_id).await;
            let bridges = self.inner.bridges.read().await;
            if let Some(bridge) = bridges.get(key) {
                bridge.client.apply(|s| s.join_channel(channel, &room_id));
            }
            return CommandResult::ok(description);
        }

        let echo = {
            let bridges = self.inner.bridges.read().await;
            let Some(bridge) = bridges.get(key) else {
                return CommandResult::error("not connected to IRC");
            };
            let (nick, current) = bridge
                .client
                .with_session(|s| (s.nick().to_string(), s.current_channel().map(String::from)));
            match command.to_lines(current.as_deref()) {
                Ok(lines) => lines.into_iter().for_each(|line| bridge.client.send_line(line)),
                Err(e) => return CommandResult::from(e),
            }
            match (&command, current) {
                (SlashCommand::Me { text }, Some(channel)) => Some(IrcMessage {
                    target: channel,
                    nick,
                    text: text.clone(),
                    is_action: true,
                }),
                _ => None,
            }
        };

        if let Some(message) = echo {
            self.deliver_message(key, message).await;
        }
        CommandResult::ok(description)
    }

    /// Close the socket's private bridge, if any.
    pub async fn disconnect(&self, socket_id: &str, message: Option<&str>) {
        let key = BridgeKey::Private(socket_id.to_string());
        let cancelled = self.inner.queued.write().await.remove(&key);
        let removed = self.inner.bridges.write().await.remove(&key);

        match removed {
            Some(bridge) => {
                info!(socket_id, "Closing private IRC bridge");
                bridge.client.shutdown(message);
            }
            None if !cancelled => return,
            None => {}
        }
        self.inner
            .dispatcher
            .send_to_socket(
                socket_id,
                ServerEvent::IrcDisconnected {
                    reason: message.map(String::from),
                },
            )
            .await;
    }

    /// Quit every bridge, e.g. at shutdown.
    pub async fn shutdown(&self) {
        self.inner.queued.write().await.clear();
        let bridges: Vec<_> = self.inner.bridges.write().await.drain().collect();
        for (key, bridge) in bridges {
            debug!(label = %key.label(), "Closing IRC bridge");
            bridge.client.shutdown(Some("Server shutting down"));
        }
    }

    async fn room_of_socket(&self, socket_id: &str) -> String {
        let registry = self.inner.dispatcher.registry().read().await;
        match (registry.room_of(socket_id), &self.inner.config) {
            (Some(room_id), _) => room_id.to_string(),
            (None, Some(config)) => config.default_room.clone(),
            (None, None) => String::new(),
        }
    }

    async fn send_error(&self, socket_id: &str, message: &str) {
        self.inner
            .dispatcher
            .send_to_socket(
                socket_id,
                ServerEvent::IrcError {
                    message: message.to_string(),
                },
            )
            .await;
    }

    /// Send `event` to whoever listens to this bridge: the owning socket of a
    /// private bridge, or the rooms of the shared relay (the room mapped to
    /// `channel`, or every mapped room when there is none).
    async fn deliver(&self, key: &BridgeKey, channel: Option<&str>, event: ServerEvent) {
        let dispatcher = &self.inner.dispatcher;
        match key {
            BridgeKey::Private(socket_id) => dispatcher.send_to_socket(socket_id, event).await,
            BridgeKey::Shared => {
                let rooms: Vec<String> = self
                    .with_session(key, |s| match channel {
                        Some(channel) => s.room_for(channel).map(String::from).into_iter().collect(),
                        None => s.channels().filter_map(|c| s.room_for(c).map(String::from)).collect(),
                    })
                    .await
                    .unwrap_or_default();
                for room_id in rooms {
                    dispatcher
                        .broadcast_room(&room_id, event.clone(), Audience::Everyone)
                        .await;
                }
            }
        }
    }

    /// Translate a channel message into chat and hand it to its listeners.
    async fn deliver_message(&self, key: &BridgeKey, message: IrcMessage) {
        let dispatcher = &self.inner.dispatcher;
        let mapped = self
            .with_session(key, |s| {
                s.is_channel_target(&message.target)
                    .then(|| s.room_for(&message.target).map(String::from))
                    .flatten()
            })
            .await
            .flatten();

        let room_id = match (key, mapped) {
            (_, Some(room_id)) => room_id,
            (BridgeKey::Private(socket_id), None) => self.room_of_socket(socket_id).await,
            (BridgeKey::Shared, None) => {
                debug!(from = %message.nick, "Ignoring private message to the relay");
                return;
            }
        };

        let text = if message.is_action {
            format!("* {} {}", message.nick, message.text)
        } else {
            message.text
        };
        let chat = ChatMessage {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.clone(),
            text,
            sender_color: Some(nick_color(&message.nick).to_string()),
            sender: message.nick,
            sender_id: None,
            timestamp: now_ms(),
            source: MessageSource::Irc,
            channel: Some(message.target),
        };

        match key {
            BridgeKey::Private(socket_id) => {
                dispatcher
                    .send_to_socket(socket_id, ServerEvent::ChatMessage(chat))
                    .await;
            }
            BridgeKey::Shared => {
                if let Some(room) = dispatcher.registry().write().await.room_mut(&room_id) {
                    room.push_message(StoredMessage {
                        message: chat.clone(),
                        shadowed: false,
                        author_key: None,
                    });
                }
                dispatcher
                    .broadcast_room(&room_id, ServerEvent::ChatMessage(chat), Audience::Everyone)
                    .await;
            }
        }
    }

    async fn on_event(&self, key: &BridgeKey, generation: u64, event: BridgeEvent) {
        if !self.is_current(key, generation).await {
            return;
        }
        let private = matches!(key, BridgeKey::Private(_));

        match event {
            BridgeEvent::Registered { nick } => {
                info!(label = %key.label(), nick, "IRC bridge registered");
                self.deliver(key, None, ServerEvent::IrcConnected { nick, channel: None })
                    .await;
                if *key == BridgeKey::Shared {
                    let extra = self
                        .inner
                        .config
                        .as_ref()
                        .map(|c| c.extra_channels.clone())
                        .unwrap_or_default();
                    for (channel, room_id) in extra {
                        self.map_channel(&channel, &room_id).await;
                    }
                }
            }
            BridgeEvent::Joined { channel, room_id } => {
                info!(label = %key.label(), channel, room_id, "IRC channel joined");
                let nick = self
                    .with_session(key, |s| s.nick().to_string())
                    .await
                    .unwrap_or_default();
                self.deliver(
                    key,
                    Some(&channel),
                    ServerEvent::IrcConnected {
                        nick,
                        channel: Some(channel.clone()),
                    },
                )
                .await;
            }
            BridgeEvent::Parted { channel } => {
                let nick = self
                    .with_session(key, |s| s.nick().to_string())
                    .await
                    .unwrap_or_default();
                let event = ServerEvent::IrcUserLeft {
                    channel: Some(channel),
                    nick,
                    reason: None,
                };
                // The mapping is already gone, so the shared relay has no room to tell.
                if private {
                    self.deliver(key, None, event).await;
                }
            }
            BridgeEvent::Message(message) => self.deliver_message(key, message).await,
            BridgeEvent::UserJoined { channel, nick } => {
                let event = ServerEvent::IrcUserJoined {
                    channel: channel.clone(),
                    nick,
                };
                self.deliver(key, Some(&channel), event).await;
            }
            BridgeEvent::UserLeft { channel, nick, reason } => {
                let event = ServerEvent::IrcUserLeft {
                    channel: channel.clone(),
                    nick,
                    reason,
                };
                self.deliver(key, channel.as_deref(), event).await;
            }
            BridgeEvent::NickChanged { old_nick, new_nick } => {
                self.deliver(key, None, ServerEvent::IrcNickChange { old_nick, new_nick })
                    .await;
            }
            BridgeEvent::Userlist { channel, users } => {
                let event = ServerEvent::IrcUserlist {
                    channel: channel.clone(),
                    users,
                };
                self.deliver(key, Some(&channel), event).await;
            }
            BridgeEvent::Topic { channel, topic } if private => {
                let message = match topic {
                    Some(topic) => format!("topic for {}: {}", channel, topic),
                    None => format!("no topic set for {}", channel),
                };
                self.deliver(key, None, ServerEvent::IrcCommandResult { ok: true, message })
                    .await;
            }
            BridgeEvent::Notice { from, text } if private => {
                let message = format!("-{}- {}", from, text);
                self.deliver(key, None, ServerEvent::IrcCommandResult { ok: true, message })
                    .await;
            }
            BridgeEvent::Info(message) if private => {
                self.deliver(key, None, ServerEvent::IrcCommandResult { ok: true, message })
                    .await;
            }
            BridgeEvent::Error(message) if private => {
                self.deliver(key, None, ServerEvent::IrcError { message }).await;
            }
            BridgeEvent::Topic { .. } | BridgeEvent::Notice { .. } | BridgeEvent::Info(_) => {}
            BridgeEvent::Error(message) => {
                warn!(label = %key.label(), "IRC server error: {}", message);
            }
            BridgeEvent::Closed { reason } => self.on_closed(key, reason).await,
        }
    }

    async fn on_closed(&self, key: &BridgeKey, reason: Option<String>) {
        let rooms: Vec<String> = self
            .with_session(key, |s| s.channels().filter_map(|c| s.room_for(c).map(String::from)).collect())
            .await
            .unwrap_or_default();
        self.inner.bridges.write().await.remove(key);
        warn!(label = %key.label(), ?reason, "IRC bridge closed");

        let event = ServerEvent::IrcDisconnected { reason };
        match key {
            BridgeKey::Private(socket_id) => {
                self.inner.dispatcher.send_to_socket(socket_id, event).await;
            }
            BridgeKey::Shared => {
                for room_id in rooms {
                    self.inner
                        .dispatcher
                        .broadcast_room(&room_id, event.clone(), Audience::Everyone)
                        .await;
                }
                let delay = self
                    .inner
                    .config
                    .as_ref()
                    .map_or(RELAY_RECONNECT_DELAY, |c| c.reconnect_delay);
                let requeue = self.start_shared();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    info!("Re-queueing shared IRC relay");
                    requeue.await;
                });
            }
        }
    }
}
