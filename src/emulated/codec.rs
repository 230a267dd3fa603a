//! Emulated channel framing
//!
//! The downstream response body and the upstream request bodies carry a stream of
//! frames:
//!
//! ```text
//! 0x01 <ascii code> 0xFF           command ("00" no-op, "01" reconnect, "02" close)
//! 0x80 <length> <payload>          binary data
//! 0x81 <length> <payload>          text data
//! 0x89 0x00                        ping
//! 0x8A 0x00                        pong
//! ```
//!
//! Lengths are written in 7-bit groups, most significant group first, with the high bit
//! set on every group except the last. A close command is followed by a binary frame
//! holding the close payload (optional 2-byte status and UTF-8 reason).
//!
//! The decoder is a state machine fed with arbitrary slices of the body; a frame split
//! across any number of reads is yielded exactly once.

use bytes::{BufMut, Bytes, BytesMut};

use crate::buffer::ByteBuffer;
use crate::error::{Error, Result};
use crate::frame::encode_close_payload;
use crate::protocol::Message;

const COMMAND_START: u8 = 0x01;
const COMMAND_END: u8 = 0xFF;
const BINARY: u8 = 0x80;
const TEXT: u8 = 0x81;
const PING: u8 = 0x89;
const PONG: u8 = 0x8A;

/// Longest command code accepted before the terminator
const MAX_COMMAND_LEN: usize = 16;
/// 7-bit groups needed for a u64
const MAX_LENGTH_GROUPS: u8 = 10;

/// In-band command carried by a command frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// "00", keeps intermediaries from timing out the response
    Noop,
    /// "01", the server wants the current request replaced
    Reconnect,
    /// "02", the close payload follows as the next binary frame
    Close,
    /// Any code this client does not understand
    Unknown(Bytes),
}

impl ControlCommand {
    fn from_code(code: Bytes) -> Self {
        match &code[..] {
            b"00" => ControlCommand::Noop,
            b"01" => ControlCommand::Reconnect,
            b"02" => ControlCommand::Close,
            _ => ControlCommand::Unknown(code),
        }
    }

    fn code(&self) -> &[u8] {
        match self {
            ControlCommand::Noop => b"00",
            ControlCommand::Reconnect => b"01",
            ControlCommand::Close => b"02",
            ControlCommand::Unknown(code) => code,
        }
    }
}

/// One decoded emulated frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmulatedFrame {
    Command(ControlCommand),
    Text(Bytes),
    Binary(Bytes),
    Ping,
    Pong,
}

/// Append a command frame
pub fn encode_command(buf: &mut BytesMut, command: &ControlCommand) {
    buf.put_u8(COMMAND_START);
    buf.put_slice(command.code());
    buf.put_u8(COMMAND_END);
}

/// Append a length in 7-bit groups
pub fn encode_length(buf: &mut BytesMut, len: u64) {
    let mut groups = [0u8; MAX_LENGTH_GROUPS as usize];
    let mut n = 0;
    let mut rest = len;
    loop {
        groups[n] = (rest & 0x7F) as u8;
        n += 1;
        rest >>= 7;
        if rest == 0 {
            break;
        }
    }
    for i in (0..n).rev() {
        let more = if i > 0 { 0x80 } else { 0 };
        buf.put_u8(groups[i] | more);
    }
}

fn encode_data(buf: &mut BytesMut, kind: u8, payload: &[u8]) {
    buf.reserve(payload.len() + 1 + MAX_LENGTH_GROUPS as usize);
    buf.put_u8(kind);
    encode_length(buf, payload.len() as u64);
    buf.put_slice(payload);
}

/// Append a message in emulated framing
///
/// A close becomes the close command followed by a binary frame with its payload.
pub fn encode_message(buf: &mut BytesMut, message: &Message) {
    match message {
        Message::Text(data) => encode_data(buf, TEXT, data),
        Message::Binary(data) => encode_data(buf, BINARY, data),
        Message::Ping(_) => buf.put_slice(&[PING, 0x00]),
        Message::Pong(_) => buf.put_slice(&[PONG, 0x00]),
        Message::Close(reason) => {
            encode_command(buf, &ControlCommand::Close);
            let payload = match reason {
                Some(r) => encode_close_payload(r.code, &r.reason),
                None => Bytes::new(),
            };
            encode_data(buf, BINARY, &payload);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StartOfFrame,
    ReadingCommand,
    ReadingLength { kind: u8, len: u64, groups: u8 },
    ReadingPayload { kind: u8, len: usize },
    ReadingControl { kind: u8 },
}

/// Incremental emulated frame decoder
#[derive(Debug)]
pub struct EmulatedDecoder {
    state: State,
    buf: ByteBuffer,
    command: BytesMut,
    max_frame_size: usize,
}

impl EmulatedDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            state: State::StartOfFrame,
            buf: ByteBuffer::new(),
            command: BytesMut::with_capacity(MAX_COMMAND_LEN),
            max_frame_size,
        }
    }

    /// Append body bytes
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Whether the decoder sits between frames with nothing buffered
    pub fn is_idle(&self) -> bool {
        self.state == State::StartOfFrame && self.buf.is_empty()
    }

    /// Decode the next complete frame from the bytes fed so far
    pub fn decode(&mut self) -> Result<Option<EmulatedFrame>> {
        loop {
            match self.state {
                State::StartOfFrame => {
                    let Some(kind) = self.buf.get_u8() else {
                        return Ok(None);
                    };
                    self.state = match kind {
                        COMMAND_START => {
                            self.command.clear();
                            State::ReadingCommand
                        }
                        BINARY | TEXT => State::ReadingLength {
                            kind,
                            len: 0,
                            groups: 0,
                        },
                        PING | PONG => State::ReadingControl { kind },
                        _ => return Err(Error::InvalidFrame("unknown emulated frame type")),
                    };
                }
                State::ReadingCommand => {
                    let Some(byte) = self.buf.get_u8() else {
                        return Ok(None);
                    };
                    if byte == COMMAND_END {
                        self.state = State::StartOfFrame;
                        let code = self.command.split().freeze();
                        return Ok(Some(EmulatedFrame::Command(ControlCommand::from_code(code))));
                    }
                    if self.command.len() >= MAX_COMMAND_LEN {
                        return Err(Error::InvalidFrame("unterminated command frame"));
                    }
                    self.command.put_u8(byte);
                }
                State::ReadingLength { kind, len, groups } => {
                    let Some(byte) = self.buf.get_u8() else {
                        return Ok(None);
                    };
                    if groups >= MAX_LENGTH_GROUPS {
                        return Err(Error::InvalidFrame("length field too long"));
                    }
                    let len = (len << 7) | u64::from(byte & 0x7F);
                    if len > self.max_frame_size as u64 {
                        return Err(Error::FrameTooLarge);
                    }
                    self.state = if byte & 0x80 != 0 {
                        State::ReadingLength {
                            kind,
                            len,
                            groups: groups + 1,
                        }
                    } else {
                        State::ReadingPayload {
                            kind,
                            len: len as usize,
                        }
                    };
                }
                State::ReadingPayload { kind, len } => {
                    let Some(payload) = self.buf.take(len) else {
                        return Ok(None);
                    };
                    self.state = State::StartOfFrame;
                    return Ok(Some(if kind == TEXT {
                        EmulatedFrame::Text(payload)
                    } else {
                        EmulatedFrame::Binary(payload)
                    }));
                }
                State::ReadingControl { kind } => {
                    let Some(len) = self.buf.get_u8() else {
                        return Ok(None);
                    };
                    if len != 0 {
                        return Err(Error::InvalidFrame("ping and pong carry no payload"));
                    }
                    self.state = State::StartOfFrame;
                    return Ok(Some(if kind == PING {
                        EmulatedFrame::Ping
                    } else {
                        EmulatedFrame::Pong
                    }));
                }
            }
        }
    }
}
