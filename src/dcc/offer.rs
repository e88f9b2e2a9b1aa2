/// CTCP DCC payload decoding and encoding.
///
/// Accepted grammar (filenames may contain spaces only when quoted):
///
/// ```text
/// DCC SEND   "<filename>" <ip> <port> <size> [<token>]
/// DCC SSEND  "<filename>" <ip> <port> <size> [<token>]
/// DCC ACCEPT "<filename>" <port> <position> [<token>]
/// ```
///
/// `ip` is a dotted quad, an IPv6 literal, or — legacy DCC — the address as
/// a decimal 32-bit integer. `port` 0 marks a passive (reverse) offer: the
/// sender waits for us to listen and advertise a port back, echoing the
/// token. We emit `DCC RESUME` and the passive `DCC SEND` reply, never
/// parse them.
use std::net::{IpAddr, Ipv4Addr};

use crate::config::Config;
use crate::error::BotError;

/// A decoded `DCC SEND` / `DCC SSEND` offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DccOffer {
    pub filename: String,
    pub ip: IpAddr,
    /// 0 means passive DCC: we listen, the peer dials.
    pub port: u16,
    pub size: u64,
    pub token: Option<String>,
    /// True for SSEND: the data socket is wrapped in TLS.
    pub secure: bool,
}

/// A decoded `DCC ACCEPT` reply to our `DCC RESUME`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DccAccept {
    pub filename: String,
    pub port: u16,
    pub position: u64,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DccMessage {
    Offer(DccOffer),
    Accept(DccAccept),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DccParseError {
    #[error("not a DCC payload")]
    NotDcc,
    #[error("unsupported DCC subcommand {0}")]
    UnknownSubcommand(String),
    #[error("missing argument: {0}")]
    MissingArgument(&'static str),
    #[error("invalid {field}: {value}")]
    InvalidArgument { field: &'static str, value: String },
    #[error("unterminated quoted filename")]
    UnterminatedQuote,
}

/// Parse a CTCP payload that is expected to be a DCC message.
pub fn parse(payload: &str) -> Result<DccMessage, DccParseError> {
    let mut args = tokenize(payload)?.into_iter();

    if args.next().as_deref() != Some("DCC") {
        return Err(DccParseError::NotDcc);
    }
    let subcommand = args.next().ok_or(DccParseError::MissingArgument("subcommand"))?;

    match subcommand.to_ascii_uppercase().as_str() {
        "SEND" | "SSEND" => {
            let secure = subcommand.eq_ignore_ascii_case("SSEND");
            let filename = args.next().ok_or(DccParseError::MissingArgument("filename"))?;
            let ip = parse_ip(&args.next().ok_or(DccParseError::MissingArgument("ip"))?)?;
            let port = parse_num::<u16>("port", args.next())?;
            let size = parse_num::<u64>("size", args.next())?;
            Ok(DccMessage::Offer(DccOffer {
                filename,
                ip,
                port,
                size,
                token: args.next(),
                secure,
            }))
        }
        "ACCEPT" => {
            let filename = args.next().ok_or(DccParseError::MissingArgument("filename"))?;
            let port = parse_num::<u16>("port", args.next())?;
            let position = parse_num::<u64>("position", args.next())?;
            Ok(DccMessage::Accept(DccAccept {
                filename,
                port,
                position,
                token: args.next(),
            }))
        }
        other => Err(DccParseError::UnknownSubcommand(other.to_owned())),
    }
}

/// Encode the `DCC RESUME` request for a partially downloaded file.
pub fn encode_resume(filename: &str, port: u16, offset: u64, token: Option<&str>) -> String {
    let mut out = format!("DCC RESUME \"{}\" {port} {offset}", sanitize_quoted(filename));
    if let Some(token) = token {
        out.push(' ');
        out.push_str(token);
    }
    out
}

/// Encode the reverse-DCC `DCC SEND` reply advertising our listener.
/// IPv4 addresses use the legacy integer form, which every XDCC bot accepts.
pub fn encode_passive_reply(
    filename: &str,
    addr: IpAddr,
    port: u16,
    size: u64,
    token: &str,
    secure: bool,
) -> String {
    let subcommand = if secure { "SSEND" } else { "SEND" };
    let host = match addr {
        IpAddr::V4(v4) => u32::from(v4).to_string(),
        IpAddr::V6(v6) => v6.to_string(),
    };
    format!(
        "DCC {subcommand} \"{}\" {host} {port} {size} {token}",
        sanitize_quoted(filename)
    )
}

impl DccOffer {
    /// Reject offers that must never reach a socket: oversized files,
    /// non-routable peers (unless allowed), and filenames that are not a
    /// bare basename.
    pub fn validate(&self, config: &Config) -> Result<(), BotError> {
        if self.size > config.max_file_size {
            return Err(BotError::FileSizeExceeded {
                size: self.size,
                limit: config.max_file_size,
            });
        }
        if !config.allow_private_ips && self.port != 0 && is_non_routable(self.ip) {
            return Err(BotError::ProtocolViolation(format!(
                "private peer address {}",
                self.ip
            )));
        }
        validate_filename(&self.filename)?;
        Ok(())
    }
}

/// A valid download filename is a non-empty basename: no path separators,
/// no parent-directory escapes, nothing a filesystem would interpret.
pub fn validate_filename(filename: &str) -> Result<(), BotError> {
    if filename.is_empty() {
        return Err(BotError::ProtocolViolation("empty filename".into()));
    }
    if filename.contains('/') || filename.contains('\\') || filename.contains('\0') {
        return Err(BotError::ProtocolViolation(format!(
            "filename contains path separators: {filename}"
        )));
    }
    if filename == "." || filename == ".." || filename.contains("..") {
        return Err(BotError::ProtocolViolation(format!(
            "filename escapes the download directory: {filename}"
        )));
    }
    Ok(())
}

fn is_non_routable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                || (segments[0] & 0xfe00) == 0xfc00 // unique local fc00::/7
                || (segments[0] & 0xffc0) == 0xfe80 // link local fe80::/10
        }
    }
}

/// Split a payload into whitespace-separated tokens, honoring `"` quoting.
fn tokenize(payload: &str) -> Result<Vec<String>, DccParseError> {
    let mut tokens = Vec::new();
    let mut chars = payload.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            let mut token = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some(other) => token.push(other),
                    None => return Err(DccParseError::UnterminatedQuote),
                }
            }
            tokens.push(token);
        } else {
            let mut token = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
            tokens.push(token);
        }
    }
    Ok(tokens)
}

fn parse_ip(raw: &str) -> Result<IpAddr, DccParseError> {
    if raw.contains('.') || raw.contains(':') {
        raw.parse().map_err(|_| DccParseError::InvalidArgument {
            field: "ip",
            value: raw.to_owned(),
        })
    } else {
        // Legacy form: the IPv4 address as a decimal 32-bit integer.
        let numeric: u32 = raw.parse().map_err(|_| DccParseError::InvalidArgument {
            field: "ip",
            value: raw.to_owned(),
        })?;
        Ok(IpAddr::V4(Ipv4Addr::from(numeric)))
    }
}

fn parse_num<T: std::str::FromStr>(
    field: &'static str,
    raw: Option<String>,
) -> Result<T, DccParseError> {
    let raw = raw.ok_or(DccParseError::MissingArgument(field))?;
    raw.parse().map_err(|_| DccParseError::InvalidArgument {
        field,
        value: raw,
    })
}

/// Double quotes inside a to-be-quoted filename would break the grammar.
fn sanitize_quoted(filename: &str) -> String {
    filename.replace('"', "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_config() -> Config {
        serde_json::from_str(r#"{"default_server_config": {}}"#).unwrap()
    }

    // ── Parsing ──────────────────────────────────────────────────

    #[test]
    fn parse_send_with_legacy_ip() {
        let msg = parse("DCC SEND ep1.mkv 2130706433 5000 1048576").unwrap();
        assert_eq!(
            msg,
            DccMessage::Offer(DccOffer {
                filename: "ep1.mkv".into(),
                ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                port: 5000,
                size: 1_048_576,
                token: None,
                secure: false,
            })
        );
    }

    #[test]
    fn parse_send_quoted_filename_with_spaces() {
        let DccMessage::Offer(offer) =
            parse("DCC SEND \"some episode 01.mkv\" 10.0.0.2 4242 99 tok1").unwrap()
        else {
            panic!("expected offer");
        };
        assert_eq!(offer.filename, "some episode 01.mkv");
        assert_eq!(offer.ip, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(offer.token.as_deref(), Some("tok1"));
    }

    #[test]
    fn parse_ssend_marks_secure() {
        let DccMessage::Offer(offer) = parse("DCC SSEND x.bin 3232235777 6000 10").unwrap() else {
            panic!("expected offer");
        };
        assert!(offer.secure);
        assert_eq!(offer.ip, "192.168.1.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn parse_passive_offer_keeps_token() {
        let DccMessage::Offer(offer) = parse("DCC SEND \"x\" 0 0 100 tok42").unwrap() else {
            panic!("expected offer");
        };
        assert_eq!(offer.port, 0);
        assert_eq!(offer.token.as_deref(), Some("tok42"));
    }

    #[test]
    fn parse_accept() {
        let msg = parse("DCC ACCEPT \"ep1.mkv\" 5000 500000").unwrap();
        assert_eq!(
            msg,
            DccMessage::Accept(DccAccept {
                filename: "ep1.mkv".into(),
                port: 5000,
                position: 500_000,
                token: None,
            })
        );
    }

    #[test]
    fn parse_ipv6_literal() {
        let DccMessage::Offer(offer) = parse("DCC SEND f.bin 2001:db8::1 5000 10").unwrap() else {
            panic!("expected offer");
        };
        assert_eq!(offer.ip, "2001:db8::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(parse("VERSION"), Err(DccParseError::NotDcc));
        assert!(matches!(
            parse("DCC CHAT chat 2130706433 5000"),
            Err(DccParseError::UnknownSubcommand(_))
        ));
        assert!(matches!(
            parse("DCC SEND f.bin notanip 5000 10"),
            Err(DccParseError::InvalidArgument { field: "ip", .. })
        ));
        assert!(matches!(
            parse("DCC SEND \"unterminated 1 2 3"),
            Err(DccParseError::UnterminatedQuote)
        ));
        assert!(matches!(
            parse("DCC SEND f.bin 2130706433"),
            Err(DccParseError::MissingArgument("port"))
        ));
    }

    // ── Encoding ─────────────────────────────────────────────────

    #[test]
    fn encode_resume_with_and_without_token() {
        assert_eq!(
            encode_resume("ep1.mkv", 5000, 500_000, None),
            "DCC RESUME \"ep1.mkv\" 5000 500000"
        );
        assert_eq!(
            encode_resume("ep1.mkv", 5000, 500_000, Some("tok")),
            "DCC RESUME \"ep1.mkv\" 5000 500000 tok"
        );
    }

    #[test]
    fn encode_passive_reply_uses_integer_ipv4() {
        let reply = encode_passive_reply(
            "x",
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            40_000,
            100,
            "tok42",
            false,
        );
        assert_eq!(reply, "DCC SEND \"x\" 2130706433 40000 100 tok42");
    }

    // ── Validation ───────────────────────────────────────────────

    #[test]
    fn validate_rejects_oversize() {
        let mut config = test_config();
        config.max_file_size = 50;
        let DccMessage::Offer(offer) = parse("DCC SEND f.bin 2130706433 5000 51").unwrap() else {
            panic!()
        };
        assert!(matches!(
            offer.validate(&config),
            Err(BotError::FileSizeExceeded { size: 51, limit: 50 })
        ));
    }

    #[test]
    fn validate_zero_size_is_allowed() {
        let mut config = test_config();
        config.allow_private_ips = true;
        let DccMessage::Offer(offer) = parse("DCC SEND f.bin 2130706433 5000 0").unwrap() else {
            panic!()
        };
        offer.validate(&config).unwrap();
    }

    #[test]
    fn validate_private_ip_policy() {
        let config = test_config();
        let DccMessage::Offer(offer) = parse("DCC SEND f.bin 10.1.2.3 5000 10").unwrap() else {
            panic!()
        };
        assert!(matches!(
            offer.validate(&config),
            Err(BotError::ProtocolViolation(_))
        ));

        let mut allowed = test_config();
        allowed.allow_private_ips = true;
        offer.validate(&allowed).unwrap();
    }

    #[test]
    fn validate_rejects_path_traversal() {
        assert!(validate_filename("../../etc/passwd").is_err());
        assert!(validate_filename("a/b.bin").is_err());
        assert!(validate_filename("a\\b.bin").is_err());
        assert!(validate_filename("").is_err());
        assert!(validate_filename("plain-name.mkv").is_ok());
    }
}
