use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::Frame;
use crate::parser::{RawFrame, parse_frame_slice, unescape_header_value};

/// Frames whose headers are sent and read verbatim. STOMP 1.2 exempts the
/// connection handshake from header escaping for 1.0 compatibility.
fn is_handshake(command: &str) -> bool {
    command == "CONNECT" || command == "CONNECTED" || command == "STOMP"
}

/// Escape a STOMP 1.2 header key or value for wire transmission.
fn escape_header_value(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\\' => result.push_str("\\\\"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            ':' => result.push_str("\\c"),
            _ => result.push(ch),
        }
    }
    result
}

fn invalid_data(what: &str, err: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("{}: {}", what, err))
}

fn header_field(raw: Vec<u8>, unescape: bool, what: &str) -> io::Result<String> {
    let bytes = if unescape {
        unescape_header_value(&raw).map_err(|e| invalid_data(&format!("invalid escape in {}", what), e))?
    } else {
        raw
    };
    String::from_utf8(bytes).map_err(|e| invalid_data(&format!("invalid utf8 in {}", what), e))
}

/// Items produced or consumed by the codec.
///
/// A `StompItem` is either a decoded `Frame` or a `Heartbeat` marker
/// representing a single LF on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StompItem {
    /// A decoded STOMP frame (command + headers + body)
    Frame(Frame),
    /// A single heartbeat pulse (LF)
    Heartbeat,
}

/// `StompCodec` implements `tokio_util::codec::{Decoder, Encoder}` for the
/// STOMP wire protocol.
///
/// The WebSocket transport does not hand us a byte stream, so the
/// connection appends each inbound message to a `BytesMut` and drains it
/// with `decode` until it returns `Ok(None)`. Frames split across several
/// WebSocket messages are therefore reassembled here.
#[derive(Debug, Default)]
pub struct StompCodec {}

impl StompCodec {
    pub fn new() -> Self {
        Self {}
    }

    /// Decode every complete item currently buffered in `src`.
    ///
    /// Bytes belonging to an incomplete trailing frame stay in `src`.
    pub fn decode_all(&mut self, src: &mut BytesMut) -> io::Result<Vec<StompItem>> {
        let mut items = Vec::new();
        while let Some(item) = self.decode(src)? {
            items.push(item);
        }
        Ok(items)
    }

    fn build_frame(raw: RawFrame) -> io::Result<Frame> {
        let command =
            String::from_utf8(raw.command).map_err(|e| invalid_data("invalid utf8 in command", e))?;
        let unescape = !is_handshake(&command);
        let mut headers = Vec::with_capacity(raw.headers.len());
        for (k, v) in raw.headers {
            headers.push((
                header_field(k, unescape, "header key")?,
                header_field(v, unescape, "header value")?,
            ));
        }
        Ok(Frame {
            command,
            headers,
            body: raw.body,
        })
    }
}

impl Decoder for StompCodec {
    type Item = StompItem;
    type Error = io::Error;

    /// Decode one item from the front of `src`.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched when the buffered bytes
    /// do not yet hold a complete item.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src.first() {
            None => return Ok(None),
            Some(b'\n') => {
                src.advance(1);
                return Ok(Some(StompItem::Heartbeat));
            }
            // heartbeats sent as CRLF
            Some(b'\r') if src.get(1) == Some(&b'\n') => {
                src.advance(2);
                return Ok(Some(StompItem::Heartbeat));
            }
            Some(_) => {}
        }

        match parse_frame_slice(src.chunk()) {
            Ok(Some(raw)) => {
                src.advance(raw.consumed);
                Ok(Some(StompItem::Frame(Self::build_frame(raw)?)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(invalid_data("parse error", e)),
        }
    }
}

impl Encoder<StompItem> for StompCodec {
    type Error = io::Error;

    /// Append the wire form of `item` to `dst`.
    ///
    /// A `content-length` header is added when the body contains NUL or is
    /// not valid UTF-8 and the caller did not supply one.
    fn encode(&mut self, item: StompItem, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = match item {
            StompItem::Heartbeat => {
                dst.put_u8(b'\n');
                return Ok(());
            }
            StompItem::Frame(frame) => frame,
        };

        dst.extend_from_slice(frame.command.as_bytes());
        dst.put_u8(b'\n');

        let mut headers = frame.headers;
        let has_cl = headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("content-length"));
        if !has_cl && (frame.body.contains(&0) || std::str::from_utf8(&frame.body).is_err()) {
            headers.push(("content-length".to_string(), frame.body.len().to_string()));
        }

        let escape = !is_handshake(&frame.command);
        for (k, v) in headers {
            if escape {
                dst.extend_from_slice(escape_header_value(&k).as_bytes());
                dst.put_u8(b':');
                dst.extend_from_slice(escape_header_value(&v).as_bytes());
            } else {
                dst.extend_from_slice(k.as_bytes());
                dst.put_u8(b':');
                dst.extend_from_slice(v.as_bytes());
            }
            dst.put_u8(b'\n');
        }

        dst.put_u8(b'\n');
        dst.extend_from_slice(&frame.body);
        dst.put_u8(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_headers_are_not_escaped() {
        let mut codec = StompCodec::new();
        let mut buf = BytesMut::new();
        let connect = Frame::new("CONNECT").header("passcode", "a:b");
        codec.encode(StompItem::Frame(connect), &mut buf).unwrap();
        assert_eq!(&buf[..], b"CONNECT\npasscode:a:b\n\n\0");
    }

    #[test]
    fn send_headers_are_escaped() {
        let mut codec = StompCodec::new();
        let mut buf = BytesMut::new();
        let send = Frame::new("SEND").header("note", "a:b\nc");
        codec.encode(StompItem::Frame(send), &mut buf).unwrap();
        assert_eq!(&buf[..], b"SEND\nnote:a\\cb\\nc\n\n\0");
    }

    #[test]
    fn decode_all_keeps_partial_tail() {
        let mut codec = StompCodec::new();
        let mut buf = BytesMut::from(&b"\nRECEIPT\nreceipt-id:1\n\n\0MESSAGE\ndest"[..]);
        let items = codec.decode_all(&mut buf).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], StompItem::Heartbeat);
        assert_eq!(&buf[..], b"MESSAGE\ndest");
    }
}
