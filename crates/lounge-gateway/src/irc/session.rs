//! Connection state of one bridge, independent of any socket.
//!
//! [`BridgeSession`] consumes parsed server lines and produces effects: lines
//! to send back and events for the manager to fan out. The TCP driver in
//! `client.rs` only moves bytes.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info};

use super::protocol::{self, IrcLine, channel_key, is_channel};

/// Longest nick we will generate while dodging collisions.
pub const MAX_NICK_LEN: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Registered,
    Joining(String),
    Active,
}

/// Something the bridge observed that users should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    Registered { nick: String },
    Joined { channel: String, room_id: String },
    Parted { channel: String },
    Message(IrcMessage),
    UserJoined { channel: String, nick: String },
    UserLeft { channel: Option<String>, nick: String, reason: Option<String> },
    NickChanged { old_nick: String, new_nick: String },
    Userlist { channel: String, users: Vec<String> },
    Topic { channel: String, topic: Option<String> },
    Notice { from: String, text: String },
    Info(String),
    Error(String),
    Closed { reason: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcMessage {
    /// Channel, or our own nick for a private message
    pub target: String,
    pub nick: String,
    pub text: String,
    pub is_action: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEffect {
    Send(String),
    Emit(BridgeEvent),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub nick: String,
    pub username: String,
    pub realname: String,
    /// Auto-joined on registration, with the room it maps to
    pub default_channel: Option<(String, String)>,
}

#[derive(Debug)]
pub struct BridgeSession {
    config: SessionConfig,
    state: BridgeState,
    nick: String,
    /// Channels joined or being joined, lowercased
    channels: BTreeSet<String>,
    /// lowercased channel -> room id
    rooms: HashMap<String, String>,
    /// Channel plain text goes to
    current: Option<String>,
    pending_names: HashMap<String, Vec<String>>,
}

/// Deterministic replacement when `nick` is taken. Below the length cap an
/// underscore is appended; at the cap a numeric tail is bumped instead, so
/// every retry differs from the nick just rejected.
pub fn next_nick(nick: &str) -> String {
    if nick.chars().count() < MAX_NICK_LEN {
        return format!("{}_", nick);
    }
    let stem = nick.trim_end_matches(|c: char| c.is_ascii_digit());
    let counter = nick[stem.len()..].parse::<u64>().unwrap_or(0) + 1;
    let suffix = counter.to_string();
    let mut base: String = stem.chars().take(MAX_NICK_LEN - suffix.len()).collect();
    base.push_str(&suffix);
    base
}

impl BridgeSession {
    pub fn new(config: SessionConfig) -> Self {
        let nick = config.nick.clone();
        Self {
            config,
            state: BridgeState::Disconnected,
            nick,
            channels: BTreeSet::new(),
            rooms: HashMap::new(),
            current: None,
            pending_names: HashMap::new(),
        }
    }

    pub fn state(&self) -> &BridgeState {
        &self.state
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub fn current_channel(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn channels(&self) -> impl Iterator<Item = &String> {
        self.channels.iter()
    }

    pub fn room_for(&self, channel: &str) -> Option<&str> {
        self.rooms.get(&channel_key(channel)).map(String::as_str)
    }

    pub fn channel_for_room(&self, room_id: &str) -> Option<&str> {
        self.rooms
            .iter()
            .find(|(_, room)| *room == room_id)
            .map(|(channel, _)| channel.as_str())
    }

    /// Registration lines, sent once the socket is open.
    pub fn start(&mut self) -> Vec<SessionEffect> {
        self.state = BridgeState::Connecting;
        vec![
            SessionEffect::Send(format!("NICK {}", self.nick)),
            SessionEffect::Send(format!(
                "USER {} 0 * :{}",
                self.config.username,
                protocol::sanitize(&self.config.realname)
            )),
        ]
    }

    /// Join `channel` and map it to `room_id`. Joining a channel we are
    /// already in only updates its mapping.
    pub fn join_channel(&mut self, channel: &str, room_id: &str) -> Vec<SessionEffect> {
        let key = channel_key(channel);
        self.rooms.insert(key.clone(), room_id.to_string());
        if !self.channels.insert(key.clone()) {
            debug!(channel, room_id, "Already in channel, mapping updated");
            return Vec::new();
        }
        if self.state == BridgeState::Registered || self.state == BridgeState::Active {
            self.state = BridgeState::Joining(key);
        }
        vec![SessionEffect::Send(format!("JOIN {}", channel))]
    }

    /// Forget a channel. Returns whether we were in it.
    fn forget_channel(&mut self, channel: &str) -> bool {
        let key = channel_key(channel);
        self.rooms.remove(&key);
        if self.current.as_deref().is_some_and(|c| channel_key(c) == key) {
            self.current = self.channels.iter().find(|c| **c != key).cloned();
        }
        self.channels.remove(&key)
    }

    fn is_me(&self, nick: &str) -> bool {
        nick.eq_ignore_ascii_case(&self.nick)
    }

    pub fn handle_line(&mut self, line: &IrcLine) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        let nick = line.nick().unwrap_or_default().to_string();

        match line.command.as_str() {
            "PING" => {
                let token = line.last_param().unwrap_or_default();
                effects.push(SessionEffect::Send(format!("PONG :{}", token)));
            }

            // RPL_WELCOME
            "001" => {
                if let Some(assigned) = line.param(0) {
                    self.nick = assigned.to_string();
                }
                self.state = BridgeState::Registered;
                info!(nick = %self.nick, "IRC bridge registered");
                effects.push(SessionEffect::Emit(BridgeEvent::Registered {
                    nick: self.nick.clone(),
                }));
                if let Some((channel, room_id)) = self.config.default_channel.clone() {
                    effects.extend(self.join_channel(&channel, &room_id));
                }
            }

            // ERR_NICKNAMEINUSE
            "433" => {
                let taken = line.param(1).unwrap_or(&self.nick).to_string();
                if self.state == BridgeState::Connecting {
                    self.nick = next_nick(&self.nick);
                    info!(taken, retry = %self.nick, "Nick in use, retrying registration");
                    effects.push(SessionEffect::Send(format!("NICK {}", self.nick)));
                } else {
                    effects.push(SessionEffect::Emit(BridgeEvent::Error(format!(
                        "nickname {} is already in use",
                        taken
                    ))));
                }
            }

            "JOIN" => {
                let Some(channel) = line.param(0) else {
                    return effects;
                };
                if self.is_me(&nick) {
                    let key = channel_key(channel);
                    let room_id = self
                        .rooms
                        .entry(key.clone())
                        .or_insert_with(|| channel.to_string())
                        .clone();
                    self.channels.insert(key);
                    self.current = Some(channel.to_string());
                    self.state = BridgeState::Active;
                    effects.push(SessionEffect::Emit(BridgeEvent::Joined {
                        channel: channel.to_string(),
                        room_id,
                    }));
                } else {
                    effects.push(SessionEffect::Emit(BridgeEvent::UserJoined {
                        channel: channel.to_string(),
                        nick,
                    }));
                }
            }

            "PART" => {
                let Some(channel) = line.param(0) else {
                    return effects;
                };
                if self.is_me(&nick) {
                    self.forget_channel(channel);
                    effects.push(SessionEffect::Emit(BridgeEvent::Parted {
                        channel: channel.to_string(),
                    }));
                } else {
                    effects.push(SessionEffect::Emit(BridgeEvent::UserLeft {
                        channel: Some(channel.to_string()),
                        nick,
                        reason: line.param(1).map(String::from),
                    }));
                }
            }

            "KICK" => {
                let (Some(channel), Some(kicked)) = (line.param(0), line.param(1)) else {
                    return effects;
                };
                let reason = line.param(2).map(|r| format!("kicked: {}", r));
                if self.is_me(kicked) {
                    self.forget_channel(channel);
                    effects.push(SessionEffect::Emit(BridgeEvent::Parted {
                        channel: channel.to_string(),
                    }));
                }
                effects.push(SessionEffect::Emit(BridgeEvent::UserLeft {
                    channel: Some(channel.to_string()),
                    nick: kicked.to_string(),
                    reason,
                }));
            }

            "QUIT" => {
                effects.push(SessionEffect::Emit(BridgeEvent::UserLeft {
                    channel: None,
                    nick,
                    reason: line.param(0).map(String::from),
                }));
            }

            "NICK" => {
                let Some(new_nick) = line.param(0) else {
                    return effects;
                };
                if self.is_me(&nick) {
                    self.nick = new_nick.to_string();
                }
                effects.push(SessionEffect::Emit(BridgeEvent::NickChanged {
                    old_nick: nick,
                    new_nick: new_nick.to_string(),
                }));
            }

            "PRIVMSG" => {
                let (Some(target), Some(text)) = (line.param(0), line.param(1)) else {
                    return effects;
                };
                let (text, is_action) = match protocol::parse_action(text) {
                    Some(action) => (action, true),
                    None => (text, false),
                };
                // Other CTCP requests are not answered.
                if !is_action && text.starts_with('\x01') {
                    return effects;
                }
                effects.push(SessionEffect::Emit(BridgeEvent::Message(IrcMessage {
                    target: target.to_string(),
                    nick,
                    text: text.to_string(),
                    is_action,
                })));
            }

            "NOTICE" => {
                if let Some(text) = line.param(1) {
                    effects.push(SessionEffect::Emit(BridgeEvent::Notice {
                        from: nick,
                        text: text.to_string(),
                    }));
                }
            }

            // RPL_TOPIC
            "332" => {
                if let (Some(channel), Some(topic)) = (line.param(1), line.param(2)) {
                    effects.push(SessionEffect::Emit(BridgeEvent::Topic {
                        channel: channel.to_string(),
                        topic: Some(topic.to_string()),
                    }));
                }
            }

            // RPL_NOTOPIC
            "331" => {
                if let Some(channel) = line.param(1) {
                    effects.push(SessionEffect::Emit(BridgeEvent::Topic {
                        channel: channel.to_string(),
                        topic: None,
                    }));
                }
            }

            "TOPIC" => {
                if let Some(channel) = line.param(0) {
                    effects.push(SessionEffect::Emit(BridgeEvent::Topic {
                        channel: channel.to_string(),
                        topic: line.param(1).map(String::from),
                    }));
                }
            }

            // RPL_NAMREPLY: <me> <type> <channel> :<names>
            "353" => {
                if let (Some(channel), Some(names)) = (line.param(2), line.param(3)) {
                    self.pending_names
                        .entry(channel_key(channel))
                        .or_default()
                        .extend(
                            names
                                .split_whitespace()
                                .map(|n| n.trim_start_matches(['@', '+', '%', '~', '&']).to_string()),
                        );
                }
            }

            // RPL_ENDOFNAMES
            "366" => {
                if let Some(channel) = line.param(1) {
                    let users = self
                        .pending_names
                        .remove(&channel_key(channel))
                        .unwrap_or_default();
                    effects.push(SessionEffect::Emit(BridgeEvent::Userlist {
                        channel: channel.to_string(),
                        users,
                    }));
                }
            }

            // RPL_WHOISUSER: <me> <nick> <user> <host> * :<realname>
            "311" => {
                if let (Some(who), Some(user), Some(host)) = (line.param(1), line.param(2), line.param(3)) {
                    let realname = line.param(5).unwrap_or_default();
                    effects.push(SessionEffect::Emit(BridgeEvent::Info(format!(
                        "{} is {}@{} ({})",
                        who, user, host, realname
                    ))));
                }
            }

            // RPL_WHOISCHANNELS
            "319" => {
                if let (Some(who), Some(channels)) = (line.param(1), line.param(2)) {
                    effects.push(SessionEffect::Emit(BridgeEvent::Info(format!(
                        "{} is on {}",
                        who, channels
                    ))));
                }
            }

            // RPL_ENDOFWHOIS
            "318" => {
                if let Some(who) = line.param(1) {
                    effects.push(SessionEffect::Emit(BridgeEvent::Info(format!(
                        "end of whois for {}",
                        who
                    ))));
                }
            }

            command => {
                // Remaining error numerics (4xx/5xx) are surfaced as text.
                if command.len() == 3 && matches!(command.as_bytes()[0], b'4' | b'5') {
                    let text = line.params.get(1..).map(|p| p.join(" ")).unwrap_or_default();
                    effects.push(SessionEffect::Emit(BridgeEvent::Error(text)));
                }
            }
        }
        effects
    }

    /// PRIVMSG line relaying `text` into the channel mapped to `room_id`.
    pub fn outbound_chat(&self, room_id: &str, text: &str) -> Option<String> {
        let channel = self.channel_for_room(room_id)?;
        Some(protocol::privmsg(channel, text))
    }

    /// Whether `target` of an incoming PRIVMSG is one of our channels.
    pub fn is_channel_target(&self, target: &str) -> bool {
        is_channel(target) && self.channels.contains(&channel_key(target))
    }

    /// Channel mappings are kept so listeners can still be told about the loss.
    pub fn mark_disconnected(&mut self) {
        self.state = BridgeState::Disconnected;
        self.pending_names.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(nick: &str) -> BridgeSession {
        BridgeSession::new(SessionConfig {
            nick: nick.into(),
            username: "lounge".into(),
            realname: "Lounge bridge".into(),
            default_channel: Some(("#lounge".into(), "general".into())),
        })
    }

    fn feed(session: &mut BridgeSession, raw: &str) -> Vec<SessionEffect> {
        session.handle_line(&IrcLine::parse(raw).unwrap())
    }

    fn sent(effects: &[SessionEffect]) -> Vec<&str> {
        effects
            .iter()
            .filter_map(|e| match e {
                SessionEffect::Send(line) => Some(line.as_str()),
                SessionEffect::Emit(_) => None,
            })
            .collect()
    }

    #[test]
    fn nick_collision_retries_with_suffix() {
        let mut s = session("Guest_42");
        let start = s.start();
        assert_eq!(sent(&start), vec!["NICK Guest_42", "USER lounge 0 * :Lounge bridge"]);

        let effects = feed(&mut s, ":irc.test 433 * Guest_42 :Nickname is already in use");
        assert_eq!(sent(&effects), vec!["NICK Guest_42_"]);
        assert_eq!(s.nick(), "Guest_42_");

        let effects = feed(&mut s, ":irc.test 001 Guest_42_ :Welcome");
        assert_eq!(*s.state(), BridgeState::Joining("#lounge".into()));
        assert!(effects.contains(&SessionEffect::Emit(BridgeEvent::Registered {
            nick: "Guest_42_".into()
        })));
        assert_eq!(sent(&effects), vec!["JOIN #lounge"]);
    }

    #[test]
    fn join_confirmation_activates_and_maps_room() {
        let mut s = session("relay");
        s.start();
        feed(&mut s, ":irc.test 001 relay :Welcome");
        let effects = feed(&mut s, ":relay!u@h JOIN #Lounge");
        assert_eq!(*s.state(), BridgeState::Active);
        assert_eq!(effects, vec![SessionEffect::Emit(BridgeEvent::Joined {
            channel: "#Lounge".into(),
            room_id: "general".into(),
        })]);
        assert_eq!(s.room_for("#LOUNGE"), Some("general"));
        assert_eq!(s.current_channel(), Some("#Lounge"));
    }

    #[test]
    fn join_channel_is_idempotent() {
        let mut s = session("relay");
        s.start();
        feed(&mut s, ":irc.test 001 relay :Welcome");
        assert!(s.join_channel("#lounge", "lobby").is_empty());
        assert_eq!(s.room_for("#lounge"), Some("lobby"));

        assert_eq!(sent(&s.join_channel("#rust", "rust")), vec!["JOIN #rust"]);
        assert!(s.join_channel("#RUST", "rust").is_empty());
        let mapped: Vec<_> = s.rooms.keys().collect();
        assert!(mapped.iter().all(|c| s.channels.contains(*c)));
    }

    #[test]
    fn collision_after_registration_is_reported() {
        let mut s = session("relay");
        s.start();
        feed(&mut s, ":irc.test 001 relay :Welcome");
        let effects = feed(&mut s, ":irc.test 433 relay taken :Nickname is already in use");
        assert!(sent(&effects).is_empty());
        assert_eq!(s.nick(), "relay");
    }

    #[test]
    fn translates_channel_traffic() {
        let mut s = session("relay");
        s.start();
        assert_eq!(sent(&feed(&mut s, "PING :abc")), vec!["PONG :abc"]);

        let effects = feed(&mut s, ":bob!b@h PRIVMSG #lounge :\x01ACTION waves\x01");
        assert_eq!(effects, vec![SessionEffect::Emit(BridgeEvent::Message(IrcMessage {
            target: "#lounge".into(),
            nick: "bob".into(),
            text: "waves".into(),
            is_action: true,
        }))]);
        assert!(feed(&mut s, ":bob!b@h PRIVMSG relay :\x01VERSION\x01").is_empty());

        feed(&mut s, ":irc.test 353 relay = #lounge :@alice +bob carol");
        let effects = feed(&mut s, ":irc.test 366 relay #lounge :End of /NAMES list.");
        assert_eq!(effects, vec![SessionEffect::Emit(BridgeEvent::Userlist {
            channel: "#lounge".into(),
            users: vec!["alice".into(), "bob".into(), "carol".into()],
        })]);

        let effects = feed(&mut s, ":relay!u@h NICK relay2");
        assert_eq!(s.nick(), "relay2");
        assert_eq!(effects.len(), 1);
    }

    #[test]
    fn parting_forgets_mapping() {
        let mut s = session("relay");
        s.start();
        feed(&mut s, ":irc.test 001 relay :Welcome");
        feed(&mut s, ":relay!u@h JOIN #lounge");
        feed(&mut s, ":relay!u@h PART #lounge :bye");
        assert_eq!(s.room_for("#lounge"), None);
        assert_eq!(s.current_channel(), None);
        assert_eq!(s.channels().count(), 0);
    }

    #[test]
    fn long_nicks_stay_bounded() {
        let long = "n".repeat(MAX_NICK_LEN);
        assert_eq!(next_nick(&long).len(), MAX_NICK_LEN);
        assert_eq!(next_nick("a"), "a_");
    }

    #[test]
    fn repeated_collisions_at_length_cap_keep_changing() {
        let mut s = session(&"n".repeat(MAX_NICK_LEN));
        s.start();
        let mut tried = vec![s.nick().to_string()];
        for _ in 0..12 {
            let rejected = s.nick().to_string();
            let effects = feed(&mut s, &format!(":irc.test 433 * {} :Nickname is already in use", rejected));
            assert_eq!(sent(&effects), vec![format!("NICK {}", s.nick()).as_str()]);
            tried.push(s.nick().to_string());
        }

        assert_eq!(tried[1], format!("{}1", "n".repeat(MAX_NICK_LEN - 1)));
        assert_eq!(tried[10], format!("{}10", "n".repeat(MAX_NICK_LEN - 2)));
        let distinct: BTreeSet<_> = tried.iter().collect();
        assert_eq!(distinct.len(), tried.len());
        assert!(tried.iter().all(|n| n.chars().count() <= MAX_NICK_LEN));
    }
}
