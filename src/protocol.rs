//! Client-side RFC 6455 protocol state
//!
//! This module sits between the frame codec and the native transport:
//! - Message fragmentation and reassembly
//! - Control frame handling (ping/pong/close)
//! - Close handshake state

use bytes::{Bytes, BytesMut};

use crate::error::{CloseReason, Error, Result};
use crate::frame::{Frame, FrameParser, OpCode, decode_close_payload, encode_close_payload, encode_frame};
use crate::mask::generate_mask;
use crate::utf8::{validate_utf8, validate_utf8_incomplete};

/// WebSocket message (complete, possibly assembled from fragments)
///
/// Text payloads are UTF-8 validated before a `Message::Text` is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Text message
    Text(Bytes),
    /// Binary message
    Binary(Bytes),
    /// Ping message
    Ping(Bytes),
    /// Pong message
    Pong(Bytes),
    /// Close message
    Close(Option<CloseReason>),
}

impl Message {
    /// Create a text message from a string
    #[inline]
    pub fn text(s: impl Into<String>) -> Self {
        Message::Text(Bytes::from(s.into()))
    }

    /// Create a binary message
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Message::Binary(data.into())
    }

    /// Check if this is a text message
    #[inline]
    pub fn is_text(&self) -> bool {
        matches!(self, Message::Text(_))
    }

    /// Check if this is a binary message
    #[inline]
    pub fn is_binary(&self) -> bool {
        matches!(self, Message::Binary(_))
    }

    /// Check if this is a control message
    #[inline]
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Message::Ping(_) | Message::Pong(_) | Message::Close(_)
        )
    }

    /// Get message as text (returns None for non-text or invalid UTF-8)
    #[inline]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Get message as bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(b) | Message::Binary(b) | Message::Ping(b) | Message::Pong(b) => b,
            Message::Close(_) => &[],
        }
    }

    /// Convert to binary data
    pub fn into_bytes(self) -> Bytes {
        match self {
            Message::Text(b) | Message::Binary(b) | Message::Ping(b) | Message::Pong(b) => b,
            Message::Close(_) => Bytes::new(),
        }
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::Text(Bytes::from(s))
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message::Text(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Vec<u8>> for Message {
    fn from(v: Vec<u8>) -> Self {
        Message::Binary(Bytes::from(v))
    }
}

impl From<Bytes> for Message {
    fn from(b: Bytes) -> Self {
        Message::Binary(b)
    }
}

/// Close handshake state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    /// Close frame sent, waiting for the echo
    CloseSent,
    /// Close frame received, echo not yet written
    CloseReceived,
    Closed,
}

/// Client protocol handler
///
/// Handles frame parsing, message assembly and control frame processing. Outgoing
/// frames are always masked with a fresh key.
pub struct Protocol {
    state: State,
    parser: FrameParser,
    fragment_buf: BytesMut,
    fragment_opcode: Option<OpCode>,
    max_message_size: usize,
    pending_close: Option<CloseReason>,
}

impl Protocol {
    /// Create a new protocol handler
    pub fn new(max_frame_size: usize, max_message_size: usize) -> Self {
        Self {
            state: State::Open,
            parser: FrameParser::new(max_frame_size, false),
            fragment_buf: BytesMut::new(),
            fragment_opcode: None,
            max_message_size,
            pending_close: None,
        }
    }

    /// Check if the close handshake has completed
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Check if we're in the closing handshake
    #[inline]
    pub fn is_closing(&self) -> bool {
        matches!(self.state, State::CloseSent | State::CloseReceived)
    }

    /// Whether the peer's close still needs to be echoed
    #[inline]
    pub fn needs_close_response(&self) -> bool {
        self.state == State::CloseReceived
    }

    /// Process incoming data into complete messages
    ///
    /// Consumes every complete frame in `buf`; a trailing partial frame is kept in the
    /// parser and finished by a later call.
    pub fn process_into(&mut self, buf: &mut BytesMut, messages: &mut Vec<Message>) -> Result<()> {
        while !buf.is_empty() {
            match self.parser.parse(buf)? {
                Some(frame) => {
                    if let Some(msg) = self.handle_frame(frame)? {
                        messages.push(msg);
                    }
                }
                None => break,
            }
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<Option<Message>> {
        match frame.header.opcode {
            OpCode::Continuation => self.handle_continuation(frame),
            OpCode::Text | OpCode::Binary => self.handle_data(frame),
            OpCode::Close => self.handle_close(frame),
            OpCode::Ping => Ok(Some(Message::Ping(frame.payload))),
            OpCode::Pong => Ok(Some(Message::Pong(frame.payload))),
        }
    }

    fn handle_data(&mut self, frame: Frame) -> Result<Option<Message>> {
        if self.fragment_opcode.is_some() {
            return Err(Error::Protocol("expected continuation frame"));
        }
        let opcode = frame.header.opcode;

        if !frame.header.fin {
            self.start_fragment(opcode, frame.payload)?;
            return Ok(None);
        }
        if frame.payload.len() > self.max_message_size {
            return Err(Error::MessageTooLarge);
        }

        if opcode == OpCode::Text {
            if !validate_utf8(&frame.payload) {
                return Err(Error::InvalidUtf8);
            }
            Ok(Some(Message::Text(frame.payload)))
        } else {
            Ok(Some(Message::Binary(frame.payload)))
        }
    }

    fn handle_continuation(&mut self, frame: Frame) -> Result<Option<Message>> {
        let opcode = self
            .fragment_opcode
            .ok_or(Error::Protocol("unexpected continuation frame"))?;

        if self.fragment_buf.len() + frame.payload.len() > self.max_message_size {
            return Err(Error::MessageTooLarge);
        }
        self.fragment_buf.extend_from_slice(&frame.payload);

        if frame.header.fin {
            self.complete_fragment(opcode)
        } else {
            self.check_partial_text(opcode)?;
            Ok(None)
        }
    }

    fn start_fragment(&mut self, opcode: OpCode, payload: Bytes) -> Result<()> {
        if payload.len() > self.max_message_size {
            return Err(Error::MessageTooLarge);
        }
        self.fragment_opcode = Some(opcode);
        self.fragment_buf.clear();
        self.fragment_buf.extend_from_slice(&payload);
        self.check_partial_text(opcode)
    }

    fn check_partial_text(&self, opcode: OpCode) -> Result<()> {
        if opcode == OpCode::Text {
            let (valid, _incomplete) = validate_utf8_incomplete(&self.fragment_buf);
            if !valid {
                return Err(Error::InvalidUtf8);
            }
        }
        Ok(())
    }

    fn complete_fragment(&mut self, opcode: OpCode) -> Result<Option<Message>> {
        self.fragment_opcode = None;
        let data = self.fragment_buf.split().freeze();

        match opcode {
            OpCode::Text => {
                if !validate_utf8(&data) {
                    return Err(Error::InvalidUtf8);
                }
                Ok(Some(Message::Text(data)))
            }
            OpCode::Binary => Ok(Some(Message::Binary(data))),
            _ => Err(Error::Protocol("invalid fragment opcode")),
        }
    }

    fn handle_close(&mut self, frame: Frame) -> Result<Option<Message>> {
        let reason = match frame.payload.len() {
            0 => None,
            1 => return Err(Error::Protocol("invalid close frame payload")),
            _ => {
                if !validate_utf8(&frame.payload[2..]) {
                    return Err(Error::InvalidUtf8);
                }
                let reason = decode_close_payload(&frame.payload);
                if let Some(r) = &reason {
                    if !CloseReason::is_valid_code(r.code) {
                        return Err(Error::Protocol("invalid close code from peer"));
                    }
                }
                reason
            }
        };

        match self.state {
            State::Open => {
                self.state = State::CloseReceived;
                self.pending_close = reason.clone();
            }
            State::CloseSent => self.state = State::Closed,
            _ => {}
        }

        Ok(Some(Message::Close(reason)))
    }

    /// Encode a data message for sending
    pub fn encode_message(&mut self, msg: &Message, buf: &mut BytesMut) -> Result<()> {
        if self.state != State::Open {
            return Err(Error::InvalidState("close handshake in progress"));
        }
        let opcode = match msg {
            Message::Text(_) => OpCode::Text,
            Message::Binary(_) => OpCode::Binary,
            Message::Ping(_) => OpCode::Ping,
            Message::Pong(_) => OpCode::Pong,
            Message::Close(reason) => return self.encode_close(reason.as_ref(), buf),
        };
        encode_frame(buf, opcode, msg.as_bytes(), true, Some(generate_mask()));
        Ok(())
    }

    /// Encode a client-initiated close
    ///
    /// The code and reason are validated first; on failure nothing is written.
    pub fn encode_close(&mut self, reason: Option<&CloseReason>, buf: &mut BytesMut) -> Result<()> {
        let frame = match reason {
            Some(r) => Frame::client_close(r.code, &r.reason)?,
            None => Frame::close_empty(),
        };
        frame.encode(buf, Some(generate_mask()));
        if self.state == State::Open {
            self.state = State::CloseSent;
        }
        Ok(())
    }

    /// Encode a pong response for a ping
    pub fn encode_pong(&mut self, ping_data: &[u8], buf: &mut BytesMut) {
        encode_frame(buf, OpCode::Pong, ping_data, true, Some(generate_mask()));
    }

    /// Encode the echo of a server-initiated close
    pub fn encode_close_response(&mut self, buf: &mut BytesMut) {
        let payload = match &self.pending_close {
            Some(r) => encode_close_payload(r.code, &r.reason),
            None => Bytes::new(),
        };
        encode_frame(buf, OpCode::Close, &payload, true, Some(generate_mask()));

        if self.state == State::CloseReceived {
            self.state = State::Closed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::apply_mask;

    fn server_frame(opcode: OpCode, payload: &[u8], fin: bool) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, opcode, payload, fin, None);
        buf
    }

    fn process(protocol: &mut Protocol, buf: &mut BytesMut) -> Result<Vec<Message>> {
        let mut out = Vec::new();
        protocol.process_into(buf, &mut out)?;
        Ok(out)
    }

    #[test]
    fn test_single_text_message() {
        let mut protocol = Protocol::new(1 << 16, 1 << 20);
        let mut buf = server_frame(OpCode::Text, b"hi", true);
        let messages = process(&mut protocol, &mut buf).unwrap();
        assert_eq!(messages, vec![Message::text("hi")]);
    }

    #[test]
    fn test_fragmented_message() {
        let mut protocol = Protocol::new(1 << 16, 1 << 20);
        let mut buf = server_frame(OpCode::Text, "hé".as_bytes(), false);
        buf.extend_from_slice(&server_frame(OpCode::Continuation, b"llo", true));

        let messages = process(&mut protocol, &mut buf).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].as_text(), Some("héllo"));
    }

    #[test]
    fn test_fragment_split_inside_codepoint() {
        let euro = "€".as_bytes();
        let mut protocol = Protocol::new(1 << 16, 1 << 20);
        let mut buf = server_frame(OpCode::Text, &euro[..1], false);
        buf.extend_from_slice(&server_frame(OpCode::Continuation, &euro[1..], true));
        let messages = process(&mut protocol, &mut buf).unwrap();
        assert_eq!(messages[0].as_text(), Some("€"));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut protocol = Protocol::new(1 << 16, 1 << 20);
        let mut buf = server_frame(OpCode::Text, &[0xff, 0xfe], true);
        assert!(matches!(
            process(&mut protocol, &mut buf),
            Err(Error::InvalidUtf8)
        ));
    }

    #[test]
    fn test_message_too_large() {
        let mut protocol = Protocol::new(1 << 16, 4);
        let mut buf = server_frame(OpCode::Binary, b"abc", false);
        buf.extend_from_slice(&server_frame(OpCode::Continuation, b"def", true));
        assert!(matches!(
            process(&mut protocol, &mut buf),
            Err(Error::MessageTooLarge)
        ));
    }

    #[test]
    fn test_server_close_is_echoed() {
        let mut protocol = Protocol::new(1 << 16, 1 << 20);
        let payload = encode_close_payload(1001, "away");
        let mut buf = server_frame(OpCode::Close, &payload, true);
        let messages = process(&mut protocol, &mut buf).unwrap();
        assert_eq!(
            messages,
            vec![Message::Close(Some(CloseReason::new(1001, "away")))]
        );
        assert!(protocol.needs_close_response());

        let mut out = BytesMut::new();
        protocol.encode_close_response(&mut out);
        assert!(protocol.is_closed());

        // masked echo carries the same status
        assert_eq!(out[0], 0x88);
        assert_eq!(out[1] & 0x80, 0x80);
        let mask = [out[2], out[3], out[4], out[5]];
        let mut echoed = out[6..].to_vec();
        apply_mask(&mut echoed, mask);
        assert_eq!(&echoed[..2], &1001u16.to_be_bytes());
    }

    #[test]
    fn test_client_close_validation() {
        let mut protocol = Protocol::new(1 << 16, 1 << 20);
        let mut out = BytesMut::new();
        let bad = CloseReason::new(999, "");
        assert!(matches!(
            protocol.encode_close(Some(&bad), &mut out),
            Err(Error::InvalidCloseCode(999))
        ));
        assert!(out.is_empty());
        assert!(!protocol.is_closing());

        let good = CloseReason::new(3500, "done");
        protocol.encode_close(Some(&good), &mut out).unwrap();
        assert!(protocol.is_closing());

        // echo completes the handshake
        let mut buf = server_frame(OpCode::Close, &encode_close_payload(3500, "done"), true);
        process(&mut protocol, &mut buf).unwrap();
        assert!(protocol.is_closed());
    }

    #[test]
    fn test_send_after_close_rejected() {
        let mut protocol = Protocol::new(1 << 16, 1 << 20);
        let mut out = BytesMut::new();
        protocol.encode_close(None, &mut out).unwrap();
        assert!(matches!(
            protocol.encode_message(&Message::text("late"), &mut out),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_outgoing_frames_are_masked() {
        let mut protocol = Protocol::new(1 << 16, 1 << 20);
        let mut out = BytesMut::new();
        protocol
            .encode_message(&Message::binary(vec![1, 2, 3]), &mut out)
            .unwrap();
        assert_eq!(out[0], 0x82);
        assert_eq!(out[1], 0x80 | 3);
    }
}
