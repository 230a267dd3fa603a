//! RFC 6455 frame parsing and serialization
//!
//! Encoding writes the three-tier length field (7-bit, 16-bit, 64-bit) and masks client
//! payloads in place. Decoding is an explicit state machine that consumes only the bytes
//! currently buffered and resumes on the next read:
//!
//! ```text
//! Start -> ReadLengthByte -> [ReadExtendedLength] -> [ReadMaskKey] -> ReadPayload -> deliver
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CloseReason, Error, Result};
use crate::mask::apply_mask_offset;
use crate::{MEDIUM_MESSAGE_THRESHOLD, SMALL_MESSAGE_THRESHOLD};

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse opcode from the low nibble of the first header byte
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// A parsed WebSocket frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Mask flag (set on every client frame)
    pub masked: bool,
    /// Payload length
    pub payload_len: u64,
    /// Masking key (if masked)
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Size of the length field in bytes (1, 3 or 9, counting the 7-bit marker)
    #[inline]
    pub fn length_field_size(payload_len: u64) -> usize {
        if payload_len > MEDIUM_MESSAGE_THRESHOLD as u64 {
            9
        } else if payload_len > SMALL_MESSAGE_THRESHOLD as u64 {
            3
        } else {
            1
        }
    }

    /// Total header size in bytes
    #[inline]
    pub fn header_size(&self) -> usize {
        1 + Self::length_field_size(self.payload_len) + if self.masked { 4 } else { 0 }
    }

    /// Encode the frame header into a buffer
    #[inline]
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut b0 = self.opcode as u8;
        if self.fin {
            b0 |= 0x80;
        }
        buf.put_u8(b0);

        let mask_bit = if self.masked { 0x80 } else { 0x00 };

        if self.payload_len <= SMALL_MESSAGE_THRESHOLD as u64 {
            buf.put_u8(mask_bit | self.payload_len as u8);
        } else if self.payload_len <= MEDIUM_MESSAGE_THRESHOLD as u64 {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(self.payload_len as u16);
        } else {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(self.payload_len);
        }

        if let Some(mask) = self.mask {
            buf.put_slice(&mask);
        }
    }
}

/// A complete WebSocket frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Frame payload (already unmasked)
    pub payload: Bytes,
}

impl Frame {
    /// Create a new unmasked frame
    pub fn new(opcode: OpCode, payload: Bytes, fin: bool) -> Self {
        Self {
            header: FrameHeader {
                fin,
                opcode,
                masked: false,
                payload_len: payload.len() as u64,
                mask: None,
            },
            payload,
        }
    }

    /// Create a text frame
    #[inline]
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Text, data.into(), true)
    }

    /// Create a binary frame
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data.into(), true)
    }

    /// Create a ping frame
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data.into(), true)
    }

    /// Create a pong frame
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data.into(), true)
    }

    /// Create a close frame for a client-initiated close
    ///
    /// Fails without touching the wire when the code is not 1000 or in 3000..=4999,
    /// or the reason is longer than 123 bytes.
    pub fn client_close(code: u16, reason: &str) -> Result<Self> {
        CloseReason::validate_client(code, reason)?;
        Ok(Self::new(
            OpCode::Close,
            encode_close_payload(code, reason),
            true,
        ))
    }

    /// Create an empty close frame
    #[inline]
    pub fn close_empty() -> Self {
        Self::new(OpCode::Close, Bytes::new(), true)
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        self.header.opcode.is_control()
    }

    /// Check if this is the final fragment
    #[inline]
    pub fn is_final(&self) -> bool {
        self.header.fin
    }

    /// Parse close frame payload
    pub fn parse_close(&self) -> Option<CloseReason> {
        decode_close_payload(&self.payload)
    }

    /// Serialize this frame, masking the payload when a key is given
    pub fn encode(&self, buf: &mut BytesMut, mask: Option<[u8; 4]>) {
        encode_frame(
            buf,
            self.header.opcode,
            &self.payload,
            self.header.fin,
            mask,
        );
    }
}

/// Build a close payload: 2-byte big-endian status followed by the UTF-8 reason
pub fn encode_close_payload(code: u16, reason: &str) -> Bytes {
    let mut payload = BytesMut::with_capacity(2 + reason.len());
    payload.put_u16(code);
    payload.put_slice(reason.as_bytes());
    payload.freeze()
}

/// Split a close payload into status and reason; `None` for an empty payload
pub fn decode_close_payload(payload: &[u8]) -> Option<CloseReason> {
    if payload.len() < 2 {
        return None;
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    Some(CloseReason::new(code, reason))
}

/// Frame parser state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Waiting for the fin/opcode byte
    Start,
    /// Waiting for the mask bit + 7-bit length byte
    ReadLengthByte,
    /// Waiting for the 2 or 8 byte extended length
    ReadExtendedLength,
    /// Waiting for the 4-byte masking key
    ReadMaskKey,
    /// Waiting for payload bytes
    ReadPayload,
}

/// Incremental frame decoder
///
/// Never blocks and never needs more than what is in the buffer: each call consumes
/// whatever the current state can use and returns `Ok(None)` until a frame is complete.
pub struct FrameParser {
    state: ParseState,
    fin: bool,
    opcode: OpCode,
    masked: bool,
    /// Extended length bytes still expected (2 or 8 once known)
    ext_len_size: usize,
    scratch: [u8; 8],
    scratch_len: usize,
    payload_len: u64,
    mask: Option<[u8; 4]>,
    payload: BytesMut,
    /// Maximum frame size
    max_frame_size: usize,
    /// Whether to expect masked frames (server-side parsing)
    expect_masked: bool,
}

impl FrameParser {
    /// Create a new frame parser
    pub fn new(max_frame_size: usize, expect_masked: bool) -> Self {
        Self {
            state: ParseState::Start,
            fin: false,
            opcode: OpCode::Continuation,
            masked: false,
            ext_len_size: 0,
            scratch: [0; 8],
            scratch_len: 0,
            payload_len: 0,
            mask: None,
            payload: BytesMut::new(),
            max_frame_size,
            expect_masked,
        }
    }

    /// Whether the parser is between frames
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.state == ParseState::Start
    }

    #[inline]
    fn reset(&mut self) {
        self.state = ParseState::Start;
        self.scratch_len = 0;
        self.ext_len_size = 0;
        self.payload_len = 0;
        self.mask = None;
    }

    /// Copy up to `want` bytes into the scratch area; true once it holds `want` bytes
    fn fill_scratch(&mut self, buf: &mut BytesMut, want: usize) -> bool {
        let needed = want - self.scratch_len;
        let n = needed.min(buf.len());
        self.scratch[self.scratch_len..self.scratch_len + n].copy_from_slice(&buf[..n]);
        self.scratch_len += n;
        buf.advance(n);
        self.scratch_len == want
    }

    /// Parse a frame from the buffer
    ///
    /// Returns:
    /// - Ok(Some(frame)) if a complete frame was parsed
    /// - Ok(None) if more data is needed
    /// - Err(e) if parsing failed
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            match self.state {
                ParseState::Start => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let b0 = buf.get_u8();

                    if b0 & 0x70 != 0 {
                        return Err(Error::Protocol("RSV bits must be 0"));
                    }

                    self.fin = b0 & 0x80 != 0;
                    self.opcode =
                        OpCode::from_u8(b0 & 0x0F).ok_or(Error::InvalidFrame("invalid opcode"))?;

                    if self.opcode.is_control() && !self.fin {
                        return Err(Error::Protocol("control frame must not be fragmented"));
                    }
                    self.state = ParseState::ReadLengthByte;
                }

                ParseState::ReadLengthByte => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let b1 = buf.get_u8();
                    self.masked = b1 & 0x80 != 0;

                    if self.expect_masked && !self.masked {
                        return Err(Error::Protocol("client frames must be masked"));
                    }
                    if !self.expect_masked && self.masked {
                        return Err(Error::Protocol("server frames must not be masked"));
                    }

                    match b1 & 0x7F {
                        126 => {
                            self.ext_len_size = 2;
                            self.scratch_len = 0;
                            self.state = ParseState::ReadExtendedLength;
                        }
                        127 => {
                            self.ext_len_size = 8;
                            self.scratch_len = 0;
                            self.state = ParseState::ReadExtendedLength;
                        }
                        len => {
                            self.set_payload_len(len as u64)?;
                        }
                    }
                }

                ParseState::ReadExtendedLength => {
                    if !self.fill_scratch(buf, self.ext_len_size) {
                        return Ok(None);
                    }
                    let len = if self.ext_len_size == 2 {
                        let len = u16::from_be_bytes([self.scratch[0], self.scratch[1]]) as u64;
                        if len <= SMALL_MESSAGE_THRESHOLD as u64 {
                            return Err(Error::Protocol("payload length not minimal"));
                        }
                        len
                    } else {
                        let len = u64::from_be_bytes(self.scratch);
                        if len <= MEDIUM_MESSAGE_THRESHOLD as u64 {
                            return Err(Error::Protocol("payload length not minimal"));
                        }
                        if len >> 63 != 0 {
                            return Err(Error::Protocol("payload length MSB must be 0"));
                        }
                        len
                    };
                    self.set_payload_len(len)?;
                }

                ParseState::ReadMaskKey => {
                    if !self.fill_scratch(buf, 4) {
                        return Ok(None);
                    }
                    self.mask = Some([
                        self.scratch[0],
                        self.scratch[1],
                        self.scratch[2],
                        self.scratch[3],
                    ]);
                    self.state = ParseState::ReadPayload;
                }

                ParseState::ReadPayload => {
                    let total = self.payload_len as usize;
                    let have = self.payload.len();

                    // Whole payload already buffered: hand out a view without copying
                    if have == 0 && buf.len() >= total {
                        let mut payload = buf.split_to(total);
                        if let Some(mask) = self.mask {
                            apply_mask_offset(&mut payload, mask, 0);
                        }
                        return Ok(Some(self.deliver(payload.freeze())));
                    }

                    let n = (total - have).min(buf.len());
                    let start = self.payload.len();
                    self.payload.extend_from_slice(&buf[..n]);
                    buf.advance(n);
                    if let Some(mask) = self.mask {
                        apply_mask_offset(&mut self.payload[start..], mask, start);
                    }

                    if self.payload.len() < total {
                        return Ok(None);
                    }
                    let payload = self.payload.split().freeze();
                    return Ok(Some(self.deliver(payload)));
                }
            }
        }
    }

    fn set_payload_len(&mut self, len: u64) -> Result<()> {
        if self.opcode.is_control() && len > SMALL_MESSAGE_THRESHOLD as u64 {
            return Err(Error::Protocol("control frame too large"));
        }
        if len > self.max_frame_size as u64 {
            return Err(Error::FrameTooLarge);
        }
        self.payload_len = len;
        self.scratch_len = 0;
        self.state = if self.masked {
            ParseState::ReadMaskKey
        } else {
            ParseState::ReadPayload
        };
        Ok(())
    }

    fn deliver(&mut self, payload: Bytes) -> Frame {
        let frame = Frame {
            header: FrameHeader {
                fin: self.fin,
                opcode: self.opcode,
                masked: self.masked,
                payload_len: self.payload_len,
                mask: self.mask,
            },
            payload,
        };
        self.reset();
        frame
    }
}

/// Encode a frame into a buffer
///
/// When `mask` is set the payload is copied into the buffer and masked there.
pub fn encode_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
) {
    let payload_len = payload.len();
    let header = FrameHeader {
        fin,
        opcode,
        masked: mask.is_some(),
        payload_len: payload_len as u64,
        mask,
    };

    buf.reserve(header.header_size() + payload_len);
    header.encode(buf);

    let start = buf.len();
    buf.put_slice(payload);
    if let Some(m) = mask {
        apply_mask_offset(&mut buf[start..], m, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::apply_mask;

    #[test]
    fn test_opcode() {
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(OpCode::Close.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(!OpCode::Binary.is_control());
        assert!(OpCode::Text.is_data());
        assert!(OpCode::Binary.is_data());
        assert!(OpCode::Continuation.is_data());
        assert_eq!(OpCode::from_u8(0x3), None);
    }

    #[test]
    fn test_parse_small_unmasked() {
        let mut parser = FrameParser::new(1024 * 1024, false);
        let mut buf = BytesMut::from(&[0x81, 0x05, b'h', b'e', b'l', b'l', b'o'][..]);

        let frame = parser.parse(&mut buf).unwrap().unwrap();
        assert!(frame.header.fin);
        assert_eq!(frame.header.opcode, OpCode::Text);
        assert_eq!(frame.payload.as_ref(), b"hello");
        assert!(buf.is_empty());
        assert!(parser.is_idle());
    }

    #[test]
    fn test_parse_small_masked() {
        let mut parser = FrameParser::new(1024 * 1024, true);
        let mask = [0x37, 0xfa, 0x21, 0x3d];

        let mut payload = *b"Hello";
        apply_mask(&mut payload, mask);

        let mut buf = BytesMut::new();
        buf.put_u8(0x81);
        buf.put_u8(0x85);
        buf.put_slice(&mask);
        buf.put_slice(&payload);

        let frame = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), b"Hello");
        assert_eq!(frame.header.mask, Some(mask));
    }

    #[test]
    fn test_parse_medium_length() {
        let mut parser = FrameParser::new(1024 * 1024, false);
        let payload = vec![0x42u8; 200];

        let mut buf = BytesMut::new();
        buf.put_u8(0x82);
        buf.put_u8(126);
        buf.put_u16(200);
        buf.put_slice(&payload);

        let frame = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.opcode, OpCode::Binary);
        assert_eq!(frame.payload.len(), 200);
    }

    #[test]
    fn test_length_tiers() {
        // (payload length, expected length-field size)
        let cases = [
            (0usize, 1usize),
            (125, 1),
            (126, 3),
            (65535, 3),
            (65536, 9),
            (70000, 9),
        ];
        let mask = [0xde, 0xad, 0xbe, 0xef];

        for (len, field) in cases {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let mut buf = BytesMut::new();
            encode_frame(&mut buf, OpCode::Binary, &payload, true, Some(mask));
            assert_eq!(buf.len(), 1 + field + 4 + len, "len {len}");

            let mut parser = FrameParser::new(1 << 20, true);
            let frame = parser.parse(&mut buf).unwrap().unwrap();
            assert_eq!(frame.payload.len(), len);
            assert_eq!(frame.payload.as_ref(), &payload[..]);
        }
    }

    #[test]
    fn test_parse_byte_at_a_time() {
        let mask = [1, 2, 3, 4];
        let payload: Vec<u8> = (0..300).map(|i| (i % 256) as u8).collect();
        let mut encoded = BytesMut::new();
        encode_frame(&mut encoded, OpCode::Binary, &payload, true, Some(mask));

        let mut parser = FrameParser::new(1 << 20, true);
        let mut buf = BytesMut::new();
        let mut result = None;
        for (i, byte) in encoded.iter().enumerate() {
            buf.put_u8(*byte);
            if let Some(frame) = parser.parse(&mut buf).unwrap() {
                assert_eq!(i, encoded.len() - 1, "frame delivered early");
                result = Some(frame);
            }
            assert!(buf.is_empty(), "parser must consume available bytes");
        }
        assert_eq!(result.unwrap().payload.as_ref(), &payload[..]);
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Text, b"one", true, None);
        encode_frame(&mut buf, OpCode::Text, b"two", true, None);

        let mut parser = FrameParser::new(1024, false);
        let first = parser.parse(&mut buf).unwrap().unwrap();
        let second = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(first.payload.as_ref(), b"one");
        assert_eq!(second.payload.as_ref(), b"two");
        assert!(parser.parse(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_encode_frame() {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Text, b"hello", true, None);

        assert_eq!(buf[0], 0x81);
        assert_eq!(buf[1], 0x05);
        assert_eq!(&buf[2..], b"hello");
    }

    #[test]
    fn test_encode_frame_masked() {
        let mask = [0x01, 0x02, 0x03, 0x04];
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Text, b"test", true, Some(mask));

        assert_eq!(buf[0], 0x81);
        assert_eq!(buf[1], 0x84);
        assert_eq!(&buf[2..6], &mask);

        let mut payload = buf[6..].to_vec();
        apply_mask(&mut payload, mask);
        assert_eq!(&payload, b"test");
    }

    #[test]
    fn test_control_frame_fragmentation() {
        let mut parser = FrameParser::new(1024, false);
        let mut buf = BytesMut::from(&[0x09, 0x00][..]);
        assert!(parser.parse(&mut buf).is_err());
    }

    #[test]
    fn test_rejects_rsv_and_bad_opcode() {
        let mut parser = FrameParser::new(1024, false);
        let mut buf = BytesMut::from(&[0xC1, 0x00][..]);
        assert!(matches!(parser.parse(&mut buf), Err(Error::Protocol(_))));

        let mut parser = FrameParser::new(1024, false);
        let mut buf = BytesMut::from(&[0x83, 0x00][..]);
        assert!(matches!(parser.parse(&mut buf), Err(Error::InvalidFrame(_))));
    }

    #[test]
    fn test_rejects_non_minimal_length() {
        let mut parser = FrameParser::new(1024, false);
        let mut buf = BytesMut::from(&[0x82, 126, 0x00, 0x05][..]);
        assert!(parser.parse(&mut buf).is_err());
    }

    #[test]
    fn test_frame_too_large() {
        let mut parser = FrameParser::new(100, false);
        let mut buf = BytesMut::from(&[0x82, 126, 0x01, 0x00][..]);
        assert!(matches!(parser.parse(&mut buf), Err(Error::FrameTooLarge)));
    }

    #[test]
    fn test_client_close_frame() {
        let frame = Frame::client_close(1000, "goodbye").unwrap();
        assert_eq!(frame.header.opcode, OpCode::Close);

        let close = frame.parse_close().unwrap();
        assert_eq!(close.code, 1000);
        assert_eq!(close.reason, "goodbye");

        assert!(Frame::client_close(999, "").is_err());
        assert!(Frame::client_close(5000, "").is_err());
        assert!(Frame::client_close(3500, "").is_ok());
        assert!(Frame::client_close(1000, &"x".repeat(124)).is_err());
    }
}
