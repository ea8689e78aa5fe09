//! IRC line parsing (RFC 1459 framing, IRCv3 tags skipped).

/// Longest line we accept from a server, tags included.
pub const MAX_LINE_LENGTH: usize = 8192;

/// Room left for message text once the PRIVMSG framing and the relay's
/// prefix are counted against the 512-byte line limit.
pub const MAX_MESSAGE_BYTES: usize = 400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcLine {
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl IrcLine {
    pub fn parse(raw: &str) -> Option<Self> {
        let mut rest = raw.trim_end_matches(['\r', '\n']).trim_start();

        if rest.starts_with('@') {
            let (_, after) = rest.split_once(' ')?;
            rest = after.trim_start();
        }

        let prefix = match rest.strip_prefix(':') {
            Some(stripped) => {
                let (prefix, after) = stripped.split_once(' ')?;
                rest = after.trim_start();
                Some(prefix.to_string())
            }
            None => None,
        };

        let (command, mut rest) = match rest.split_once(' ') {
            Some((command, after)) => (command, after),
            None => (rest, ""),
        };
        if command.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((param, after)) => {
                    params.push(param.to_string());
                    rest = after;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Some(Self {
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    /// Nick part of a `nick!user@host` prefix.
    pub fn nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        Some(prefix.split_once('!').map_or(prefix, |(nick, _)| nick))
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    pub fn last_param(&self) -> Option<&str> {
        self.params.last().map(String::as_str)
    }
}

/// Strip characters that would split or corrupt a protocol line.
pub fn sanitize(text: &str) -> String {
    text.chars().filter(|c| *c != '\r' && *c != '\n' && *c != '\0').collect()
}

pub fn is_channel(target: &str) -> bool {
    target.starts_with(['#', '&'])
}

/// Normalized form used as a mapping key.
pub fn channel_key(channel: &str) -> String {
    channel.to_lowercase()
}

pub fn privmsg(target: &str, text: &str) -> String {
    format!("PRIVMSG {} :{}", target, sanitize(text))
}

pub fn action(target: &str, text: &str) -> String {
    format!("PRIVMSG {} :\x01ACTION {}\x01", target, sanitize(text))
}

/// Cut `text` to at most `max` bytes on a char boundary.
pub fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn is_nick_special(c: char) -> bool {
    matches!(c, '[' | ']' | '\\' | '`' | '_' | '^' | '{' | '|' | '}')
}

/// RFC 2812 nickname shape, with a relaxed length limit.
pub fn is_valid_nick(nick: &str, max_len: usize) -> bool {
    let mut chars = nick.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    nick.len() <= max_len
        && (first.is_ascii_alphabetic() || is_nick_special(first))
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || is_nick_special(c))
}

/// Split a CTCP ACTION payload out of a PRIVMSG body.
pub fn parse_action(text: &str) -> Option<&str> {
    text.strip_prefix("\x01ACTION ")
        .map(|body| body.strip_suffix('\x01').unwrap_or(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prefix_command_and_trailing() {
        let line = IrcLine::parse(":nick!user@host PRIVMSG #rust :hello there\r\n").unwrap();
        assert_eq!(line.prefix.as_deref(), Some("nick!user@host"));
        assert_eq!(line.command, "PRIVMSG");
        assert_eq!(line.params, vec!["#rust", "hello there"]);
        assert_eq!(line.nick(), Some("nick"));
    }

    #[test]
    fn parses_numeric_without_trailing() {
        let line = IrcLine::parse(":irc.example.net 433 * Guest_42 :Nickname is already in use").unwrap();
        assert_eq!(line.command, "433");
        assert_eq!(line.param(1), Some("Guest_42"));
        assert_eq!(line.nick(), Some("irc.example.net"));
    }

    #[test]
    fn skips_tags_and_handles_bare_commands() {
        let line = IrcLine::parse("@time=2024-01-01T00:00:00Z PING :token").unwrap();
        assert_eq!(line.command, "PING");
        assert_eq!(line.last_param(), Some("token"));

        let bare = IrcLine::parse("ping").unwrap();
        assert_eq!(bare.command, "PING");
        assert!(bare.params.is_empty());

        assert!(IrcLine::parse("").is_none());
        assert!(IrcLine::parse(":only-prefix").is_none());
    }

    #[test]
    fn builds_safe_lines() {
        assert_eq!(privmsg("#a", "hi\r\nQUIT"), "PRIVMSG #a :hiQUIT");
        assert_eq!(action("#a", "waves"), "PRIVMSG #a :\x01ACTION waves\x01");
        assert_eq!(parse_action("\x01ACTION waves\x01"), Some("waves"));
        assert_eq!(parse_action("plain"), None);
    }

    #[test]
    fn nick_shapes() {
        assert!(is_valid_nick("Guest_42", 30));
        assert!(is_valid_nick("[away]", 30));
        assert!(!is_valid_nick("42guest", 30));
        assert!(!is_valid_nick("two words", 30));
        assert!(!is_valid_nick("", 30));
        assert!(!is_valid_nick("abcdef", 5));
    }

    #[test]
    fn truncates_on_char_boundary() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("héllo", 3), "hé");
    }
}
