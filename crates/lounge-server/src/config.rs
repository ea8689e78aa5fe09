use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use uuid::Uuid;

use lounge_gateway::irc::IrcConfig;

/// Server settings, read from `LOUNGE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Remote store; `None` keeps all shared state in memory
    pub redis_url: Option<String>,
    /// Tag for this process on the cross-instance bus
    pub instance_id: String,
    /// How long an idle room's tube state survives in the store
    pub tube_grace: Duration,
    /// `None` when no IRC server is configured
    pub irc: Option<IrcConfig>,
    /// Start the shared relay at boot
    pub irc_shared: bool,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn var_or(name: &str, default: &str) -> String {
    var(name).unwrap_or_else(|| default.to_string())
}

fn parse_var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{} has an invalid value: {}", name, raw)),
        None => Ok(default),
    }
}

/// `#rust=rust, #music` -> `[("#rust", "rust"), ("#music", "music")]`.
/// A channel without `=room` maps to the room of the same name.
fn parse_channel_map(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (channel, room) = match entry.split_once('=') {
                Some((channel, room)) => (channel.trim(), room.trim()),
                None => (entry, entry.trim_start_matches(['#', '&'])),
            };
            let channel = if channel.starts_with(['#', '&']) {
                channel.to_string()
            } else {
                format!("#{}", channel)
            };
            (channel, room.to_string())
        })
        .filter(|(_, room)| !room.is_empty())
        .collect()
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let irc = match var("LOUNGE_IRC_SERVER") {
            Some(server) => Some(IrcConfig {
                server,
                port: parse_var("LOUNGE_IRC_PORT", 6667)?,
                relay_nick: var_or("LOUNGE_IRC_NICK", "LoungeRelay"),
                default_channel: var_or("LOUNGE_IRC_CHANNEL", "#lounge"),
                default_room: var_or("LOUNGE_IRC_ROOM", "general"),
                extra_channels: var("LOUNGE_IRC_EXTRA_CHANNELS")
                    .map(|raw| parse_channel_map(&raw))
                    .unwrap_or_default(),
                reconnect_delay: Duration::from_secs(parse_var("LOUNGE_IRC_RECONNECT_SECS", 30)?),
            }),
            None => None,
        };

        Ok(Self {
            host: var_or("LOUNGE_HOST", "0.0.0.0"),
            port: parse_var("LOUNGE_PORT", 3000)?,
            redis_url: var("LOUNGE_REDIS_URL"),
            instance_id: var("LOUNGE_INSTANCE_ID").unwrap_or_else(|| Uuid::new_v4().to_string()),
            tube_grace: Duration::from_secs(parse_var("LOUNGE_TUBE_GRACE_SECS", 3600)?),
            irc_shared: parse_var("LOUNGE_IRC_SHARED", false)?,
            irc,
        })
    }
}
