/// The IRC message model.
///
/// Parses and serializes the RFC 1459/2812 message format:
///   [`:`prefix SPACE] command [SPACE params] [SPACE `:` trailing]
///
/// Also provides the CTCP layer: extracting `\x01`-delimited payloads from
/// PRIVMSG/NOTICE text and the low-level quoting CTCP requires for literal
/// `\x01`, `\r`, `\n` and NUL bytes.
use std::fmt;

/// A parsed IRC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Optional prefix (server name or `nick!user@host`).
    pub prefix: Option<String>,
    /// The command (e.g. `PRIVMSG`, `001`, `JOIN`).
    pub command: String,
    /// Parameters — the last may have been a trailing param (with spaces).
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,
    #[error("prefix present but missing command")]
    MissingCommand,
}

impl Message {
    pub fn new(command: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            prefix: None,
            command: command.into(),
            params,
        }
    }

    /// Build a PRIVMSG.
    pub fn privmsg(target: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new("PRIVMSG", vec![target.into(), text.into()])
    }

    /// Build a NOTICE.
    pub fn notice(target: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new("NOTICE", vec![target.into(), text.into()])
    }

    /// Build a PRIVMSG whose text is a CTCP payload.
    pub fn ctcp(target: impl Into<String>, payload: &str) -> Self {
        Self::privmsg(target, format!("\x01{}\x01", ctcp_quote(payload)))
    }

    /// Build a NOTICE whose text is a CTCP payload (a CTCP *reply*).
    pub fn ctcp_reply(target: impl Into<String>, payload: &str) -> Self {
        Self::notice(target, format!("\x01{}\x01", ctcp_quote(payload)))
    }

    /// Parse a single IRC message from a line (without the trailing `\r\n`).
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let input = input.trim_end_matches(['\r', '\n']);
        if input.is_empty() {
            return Err(ParseError::Empty);
        }

        let (prefix, rest) = match input.strip_prefix(':') {
            Some(prefixed) => match prefixed.split_once(' ') {
                Some((prefix, rest)) => (Some(prefix.to_owned()), rest),
                None => return Err(ParseError::MissingCommand),
            },
            None => (None, input),
        };

        let (command, mut remaining) = match rest.split_once(' ') {
            Some((command, rest)) => (command, rest),
            None => (rest, ""),
        };
        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }

        let mut params = Vec::new();
        while !remaining.is_empty() {
            if let Some(trailing) = remaining.strip_prefix(':') {
                params.push(trailing.to_owned());
                break;
            }
            match remaining.split_once(' ') {
                Some((param, rest)) => {
                    if !param.is_empty() {
                        params.push(param.to_owned());
                    }
                    remaining = rest;
                }
                None => {
                    params.push(remaining.to_owned());
                    break;
                }
            }
        }

        Ok(Message {
            prefix,
            command: command.to_owned(),
            params,
        })
    }

    /// Serialize to the IRC wire format (without trailing `\r\n`).
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        if let Some(ref prefix) = self.prefix {
            out.push(':');
            out.push_str(prefix);
            out.push(' ');
        }
        out.push_str(&self.command);

        let last = self.params.len().saturating_sub(1);
        for (i, param) in self.params.iter().enumerate() {
            out.push(' ');
            // Trailing form whenever the param needs it: spaces, empty, or a
            // leading colon would otherwise break re-parsing.
            if i == last && (param.is_empty() || param.contains(' ') || param.starts_with(':')) {
                out.push(':');
            }
            out.push_str(param);
        }
        out
    }

    /// The nick part of a `nick!user@host` prefix, if any.
    pub fn source_nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        Some(prefix.split('!').next().unwrap_or(prefix))
    }

    /// The trailing text of a PRIVMSG/NOTICE.
    pub fn text(&self) -> Option<&str> {
        self.params.last().map(String::as_str)
    }

    /// If this message carries a CTCP payload, return it dequoted.
    pub fn ctcp_payload(&self) -> Option<String> {
        let text = self.text()?;
        let inner = text.strip_prefix('\x01')?;
        let inner = inner.strip_suffix('\x01').unwrap_or(inner);
        Some(ctcp_dequote(inner))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

/// CTCP low-level + X-quoting: escape bytes that cannot appear literally
/// inside a `\x01`-delimited payload.
pub fn ctcp_quote(payload: &str) -> String {
    let mut out = String::with_capacity(payload.len());
    for c in payload.chars() {
        match c {
            '\x10' => out.push_str("\x10\x10"),
            '\0' => out.push_str("\x100"),
            '\n' => out.push_str("\x10n"),
            '\r' => out.push_str("\x10r"),
            '\\' => out.push_str("\\\\"),
            '\x01' => out.push_str("\\a"),
            other => out.push(other),
        }
    }
    out
}

/// Inverse of [`ctcp_quote`]. Unknown escape pairs decode to the escaped
/// character, per the CTCP specification.
pub fn ctcp_dequote(payload: &str) -> String {
    let mut out = String::with_capacity(payload.len());
    let mut chars = payload.chars();
    while let Some(c) = chars.next() {
        match c {
            '\x10' => match chars.next() {
                Some('0') => out.push('\0'),
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('\x10') => out.push('\x10'),
                Some(other) => out.push(other),
                None => {}
            },
            '\\' => match chars.next() {
                Some('a') => out.push('\x01'),
                Some('\\') => out.push('\\'),
                Some(other) => out.push(other),
                None => {}
            },
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // ── Parsing ──────────────────────────────────────────────────

    #[test]
    fn parse_bare_command() {
        let msg = Message::parse("QUIT").unwrap();
        assert_eq!(msg.prefix, None);
        assert_eq!(msg.command, "QUIT");
        assert!(msg.params.is_empty());
    }

    #[test]
    fn parse_privmsg_with_trailing() {
        let msg = Message::parse(":bot!xdcc@host PRIVMSG dccbot :xdcc send 5").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("bot!xdcc@host"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["dccbot", "xdcc send 5"]);
        assert_eq!(msg.source_nick(), Some("bot"));
    }

    #[test]
    fn parse_numeric() {
        let msg = Message::parse(":irc.example.net 001 dccbot :Welcome").unwrap();
        assert_eq!(msg.command, "001");
        assert_eq!(msg.params, vec!["dccbot", "Welcome"]);
        assert_eq!(msg.source_nick(), Some("irc.example.net"));
    }

    #[test]
    fn parse_ping() {
        let msg = Message::parse("PING :token123\r\n").unwrap();
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, vec!["token123"]);
    }

    #[test]
    fn parse_kick_with_reason() {
        let msg = Message::parse(":op!u@h KICK #chan dccbot :flooding").unwrap();
        assert_eq!(msg.params, vec!["#chan", "dccbot", "flooding"]);
    }

    #[test]
    fn parse_empty_trailing() {
        let msg = Message::parse("TOPIC #chan :").unwrap();
        assert_eq!(msg.params, vec!["#chan", ""]);
    }

    #[test]
    fn parse_collapses_double_spaces() {
        let msg = Message::parse("MODE  #chan +o dccbot").unwrap();
        assert_eq!(msg.params, vec!["#chan", "+o", "dccbot"]);
    }

    #[test]
    fn parse_rejects_empty_and_prefix_only() {
        assert_eq!(Message::parse(""), Err(ParseError::Empty));
        assert_eq!(Message::parse(":prefix"), Err(ParseError::MissingCommand));
    }

    // ── Serialization ────────────────────────────────────────────

    #[test]
    fn wire_simple_params_stay_bare() {
        let msg = Message::new("JOIN", vec!["#downloads".into()]);
        assert_eq!(msg.to_wire(), "JOIN #downloads");
    }

    #[test]
    fn wire_trailing_with_spaces() {
        let msg = Message::privmsg("bot", "xdcc send 5");
        assert_eq!(msg.to_wire(), "PRIVMSG bot :xdcc send 5");
    }

    #[test]
    fn wire_user_registration() {
        let msg = Message::new(
            "USER",
            vec!["dccbot".into(), "0".into(), "*".into(), "dccbot".into()],
        );
        assert_eq!(msg.to_wire(), "USER dccbot 0 * dccbot");
    }

    #[test]
    fn roundtrip_privmsg() {
        let input = ":bot!xdcc@host PRIVMSG #chan :** Sending you pack #1";
        assert_eq!(Message::parse(input).unwrap().to_wire(), input);
    }

    // ── CTCP ─────────────────────────────────────────────────────

    #[test]
    fn ctcp_payload_extraction() {
        let msg =
            Message::parse(":bot!u@h PRIVMSG dccbot :\x01DCC SEND file.bin 2130706433 5000 64\x01")
                .unwrap();
        assert_eq!(
            msg.ctcp_payload().as_deref(),
            Some("DCC SEND file.bin 2130706433 5000 64")
        );
    }

    #[test]
    fn non_ctcp_text_has_no_payload() {
        let msg = Message::privmsg("dccbot", "plain text");
        assert_eq!(msg.ctcp_payload(), None);
    }

    #[test]
    fn ctcp_builder_wraps_payload() {
        let msg = Message::ctcp("bot", "DCC RESUME \"a b.bin\" 5000 100");
        assert_eq!(
            msg.to_wire(),
            "PRIVMSG bot :\x01DCC RESUME \"a b.bin\" 5000 100\x01"
        );
    }

    #[test]
    fn ctcp_quoting_roundtrips_control_bytes() {
        let raw = "a\x01b\r\nc\0d\\e\x10f";
        assert_eq!(ctcp_dequote(&ctcp_quote(raw)), raw);
    }

    #[test]
    fn ctcp_dequote_tolerates_unknown_escapes() {
        assert_eq!(ctcp_dequote("\\x"), "x");
        assert_eq!(ctcp_dequote("\x10z"), "z");
    }
}
