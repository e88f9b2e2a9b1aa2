/// Line framing for IRC connections.
///
/// Splits the byte stream on `\r\n` (tolerating bare `\n` from sloppy
/// servers) and decodes lossily: Latin-1 garbage in channel chatter becomes
/// replacement characters instead of killing the session. Outgoing lines
/// are clamped to the 510-byte RFC payload limit before the terminator.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{Message, ParseError};

/// Maximum inbound line length we will buffer before giving up on a peer.
const MAX_INBOUND_LENGTH: usize = 4096;

/// Maximum outbound payload per RFC 1459, excluding `\r\n`.
const MAX_OUTBOUND_PAYLOAD: usize = 510;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("line exceeds maximum length ({MAX_INBOUND_LENGTH} bytes)")]
    LineTooLong,
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A tokio codec that frames IRC messages on line boundaries.
#[derive(Debug, Default)]
pub struct IrcCodec;

impl Decoder for IrcCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src.iter().position(|&b| b == b'\n') else {
                if src.len() > MAX_INBOUND_LENGTH {
                    return Err(CodecError::LineTooLong);
                }
                return Ok(None);
            };

            let line_bytes = src.split_to(pos);
            src.advance(1); // the \n

            // Lossy decode: invalid UTF-8 (Latin-1 servers) becomes U+FFFD
            // instead of an error.
            let line = String::from_utf8_lossy(&line_bytes);
            match Message::parse(line.trim_end_matches('\r')) {
                Ok(msg) => return Ok(Some(msg)),
                // Skip blank keepalive lines, surface real parse failures.
                Err(ParseError::Empty) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Encoder<Message> for IrcCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = item.to_wire();
        let clamped = clamp_payload(&wire);
        dst.reserve(clamped.len() + 2);
        dst.put_slice(clamped.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

/// Truncate to the 510-byte payload limit on a char boundary.
fn clamp_payload(wire: &str) -> &str {
    if wire.len() <= MAX_OUTBOUND_PAYLOAD {
        return wire;
    }
    let mut end = MAX_OUTBOUND_PAYLOAD;
    while !wire.is_char_boundary(end) {
        end -= 1;
    }
    &wire[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use pretty_assertions::assert_eq;

    // ── Decoder ──────────────────────────────────────────────────

    #[test]
    fn decode_complete_line() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::from(&b"PING :irc.example.net\r\n"[..]);
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, vec!["irc.example.net"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_terminator() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::from(&b"PRIVMSG dccbot :xdcc "[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"send 5\r\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.params, vec!["dccbot", "xdcc send 5"]);
    }

    #[test]
    fn decode_tolerates_bare_newline() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::from(&b"PING :tok\n"[..]);
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.command, "PING");
    }

    #[test]
    fn decode_latin1_is_lossy_not_fatal() {
        let mut codec = IrcCodec;
        // 0xE9 is 'é' in Latin-1, invalid UTF-8 on its own.
        let mut buf = BytesMut::from(&b"PRIVMSG #chan :caf\xe9\r\n"[..]);
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.params[0], "#chan");
        assert!(msg.params[1].starts_with("caf"));
    }

    #[test]
    fn decode_skips_blank_lines() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::from(&b"\r\nPING :tok\r\n"[..]);
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.command, "PING");
    }

    #[test]
    fn decode_rejects_unbounded_line() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::from(vec![b'A'; MAX_INBOUND_LENGTH + 1].as_slice());
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::LineTooLong)
        ));
    }

    // ── Encoder ──────────────────────────────────────────────────

    #[test]
    fn encode_appends_crlf() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Message::new("JOIN", vec!["#downloads".into()]), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"JOIN #downloads\r\n");
    }

    #[test]
    fn encode_clamps_to_rfc_payload_limit() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::new();
        let long = "x".repeat(600);
        codec.encode(Message::privmsg("#chan", long), &mut buf).unwrap();
        assert_eq!(buf.len(), MAX_OUTBOUND_PAYLOAD + 2);
        assert!(buf.ends_with(b"\r\n"));
    }

    #[test]
    fn roundtrip_through_codec() {
        let mut codec = IrcCodec;
        let original = Message::privmsg("#downloads", "hello there");
        let mut buf = BytesMut::new();
        codec.encode(original.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, original);
    }
}
