//! Slash commands typed into an IRC-bridged chat.

use thiserror::Error;

use super::protocol::{self, is_channel};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    Join { channel: String },
    Part { channel: Option<String>, reason: Option<String> },
    Nick { nick: String },
    Msg { target: String, text: String },
    Me { text: String },
    Topic { text: Option<String> },
    Names { channel: Option<String> },
    Whois { nick: String },
    Quit { message: Option<String> },
    /// Unknown command, sent to the server as written
    Raw(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("not a command")]
    NotACommand,

    #[error("not in a channel")]
    NoChannel,
}

/// Outcome reported back to the user for every command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub ok: bool,
    pub message: String,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { ok: true, message: message.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { ok: false, message: message.into() }
    }
}

impl From<CommandError> for CommandResult {
    fn from(e: CommandError) -> Self {
        Self::error(e.to_string())
    }
}

fn normalize_channel(channel: &str) -> String {
    if is_channel(channel) {
        channel.to_string()
    } else {
        format!("#{}", channel)
    }
}

/// Split off the first whitespace-delimited word.
fn word(input: &str) -> (Option<&str>, &str) {
    let input = input.trim_start();
    if input.is_empty() {
        return (None, "");
    }
    match input.split_once(char::is_whitespace) {
        Some((first, rest)) => (Some(first), rest.trim_start()),
        None => (Some(input), ""),
    }
}

fn non_empty(text: &str) -> Option<String> {
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

pub fn parse(input: &str) -> Result<SlashCommand, CommandError> {
    let body = input.trim().strip_prefix('/').ok_or(CommandError::NotACommand)?;
    let (name, args) = word(body);
    let name = name.ok_or(CommandError::NotACommand)?;

    let command = match name.to_ascii_lowercase().as_str() {
        "join" => {
            let (channel, _) = word(args);
            let channel = channel.ok_or(CommandError::Usage("/join #channel"))?;
            SlashCommand::Join { channel: normalize_channel(channel) }
        }
        "part" | "leave" => {
            let (first, rest) = word(args);
            match first {
                Some(channel) if is_channel(channel) => SlashCommand::Part {
                    channel: Some(channel.to_string()),
                    reason: non_empty(rest),
                },
                _ => SlashCommand::Part { channel: None, reason: non_empty(args) },
            }
        }
        "nick" => {
            let (nick, _) = word(args);
            let nick = nick.ok_or(CommandError::Usage("/nick <nickname>"))?;
            SlashCommand::Nick { nick: nick.to_string() }
        }
        "msg" | "query" => {
            let (target, text) = word(args);
            match (target, non_empty(text)) {
                (Some(target), Some(text)) => SlashCommand::Msg { target: target.to_string(), text },
                _ => return Err(CommandError::Usage("/msg <target> <text>")),
            }
        }
        "me" => SlashCommand::Me {
            text: non_empty(args).ok_or(CommandError::Usage("/me <action>"))?,
        },
        "topic" => SlashCommand::Topic { text: non_empty(args) },
        "names" => SlashCommand::Names {
            channel: word(args).0.map(normalize_channel),
        },
        "whois" => {
            let (nick, _) = word(args);
            let nick = nick.ok_or(CommandError::Usage("/whois <nick>"))?;
            SlashCommand::Whois { nick: nick.to_string() }
        }
        "quit" => SlashCommand::Quit { message: non_empty(args) },
        _ => SlashCommand::Raw(protocol::sanitize(body.trim())),
    };
    Ok(command)
}

impl SlashCommand {
    /// Protocol lines for this command. `current` is the channel plain text
    /// goes to.
    pub fn to_lines(&self, current: Option<&str>) -> Result<Vec<String>, CommandError> {
        let current = || current.ok_or(CommandError::NoChannel);
        let line = match self {
            Self::Join { channel } => format!("JOIN {}", channel),
            Self::Part { channel, reason } => {
                let channel = match channel {
                    Some(channel) => channel.as_str(),
                    None => current()?,
                };
                match reason {
                    Some(reason) => format!("PART {} :{}", channel, protocol::sanitize(reason)),
                    None => format!("PART {}", channel),
                }
            }
            Self::Nick { nick } => format!("NICK {}", nick),
            Self::Msg { target, text } => protocol::privmsg(target, text),
            Self::Me { text } => protocol::action(current()?, text),
            Self::Topic { text: None } => format!("TOPIC {}", current()?),
            Self::Topic { text: Some(text) } => {
                format!("TOPIC {} :{}", current()?, protocol::sanitize(text))
            }
            Self::Names { channel } => match channel {
                Some(channel) => format!("NAMES {}", channel),
                None => format!("NAMES {}", current()?),
            },
            Self::Whois { nick } => format!("WHOIS {}", nick),
            Self::Quit { message } => match message {
                Some(message) => format!("QUIT :{}", protocol::sanitize(message)),
                None => "QUIT".to_string(),
            },
            Self::Raw(line) => line.clone(),
        };
        Ok(vec![line])
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Join { channel } => format!("joining {}", channel),
            Self::Part { channel: Some(channel), .. } => format!("leaving {}", channel),
            Self::Part { channel: None, .. } => "leaving channel".to_string(),
            Self::Nick { nick } => format!("changing nick to {}", nick),
            Self::Msg { target, .. } => format!("message sent to {}", target),
            Self::Me { .. } => "action sent".to_string(),
            Self::Topic { text: None } => "requesting topic".to_string(),
            Self::Topic { text: Some(_) } => "topic set".to_string(),
            Self::Names { .. } => "requesting names".to_string(),
            Self::Whois { nick } => format!("whois {}", nick),
            Self::Quit { .. } => "disconnecting".to_string(),
            Self::Raw(line) => format!("sent: {}", line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_and_aliases() {
        assert_eq!(parse("/join rust").unwrap(), SlashCommand::Join { channel: "#rust".into() });
        assert_eq!(
            parse("/leave #rust bye all").unwrap(),
            SlashCommand::Part { channel: Some("#rust".into()), reason: Some("bye all".into()) }
        );
        assert_eq!(
            parse("/part gone fishing").unwrap(),
            SlashCommand::Part { channel: None, reason: Some("gone fishing".into()) }
        );
        assert_eq!(
            parse("/query bob hi there").unwrap(),
            SlashCommand::Msg { target: "bob".into(), text: "hi there".into() }
        );
        assert_eq!(parse("/TOPIC").unwrap(), SlashCommand::Topic { text: None });
        assert_eq!(parse("/quit").unwrap(), SlashCommand::Quit { message: None });
        assert_eq!(parse("/mode #rust +m").unwrap(), SlashCommand::Raw("mode #rust +m".into()));
    }

    #[test]
    fn missing_arguments_are_usage_errors() {
        assert_eq!(parse("/join"), Err(CommandError::Usage("/join #channel")));
        assert_eq!(parse("/nick  "), Err(CommandError::Usage("/nick <nickname>")));
        assert_eq!(parse("/msg bob"), Err(CommandError::Usage("/msg <target> <text>")));
        assert_eq!(parse("/me"), Err(CommandError::Usage("/me <action>")));
        assert_eq!(parse("/whois"), Err(CommandError::Usage("/whois <nick>")));
        assert_eq!(parse("hello"), Err(CommandError::NotACommand));
        assert_eq!(parse("/"), Err(CommandError::NotACommand));
    }

    #[test]
    fn renders_protocol_lines() {
        let current = Some("#rust");
        assert_eq!(parse("/me waves").unwrap().to_lines(current).unwrap(), vec![
            "PRIVMSG #rust :\x01ACTION waves\x01".to_string()
        ]);
        assert_eq!(parse("/topic new topic").unwrap().to_lines(current).unwrap(), vec![
            "TOPIC #rust :new topic".to_string()
        ]);
        assert_eq!(parse("/names").unwrap().to_lines(current).unwrap(), vec!["NAMES #rust".to_string()]);
        assert_eq!(parse("/quit see ya").unwrap().to_lines(None).unwrap(), vec![
            "QUIT :see ya".to_string()
        ]);
        assert_eq!(parse("/part").unwrap().to_lines(None), Err(CommandError::NoChannel));
    }

    #[test]
    fn errors_become_results() {
        let result = CommandResult::from(CommandError::Usage("/whois <nick>"));
        assert!(!result.ok);
        assert_eq!(result.message, "usage: /whois <nick>");
    }
}
