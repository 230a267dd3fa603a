//! Growable position/limit byte buffer
//!
//! `ByteBuffer` accumulates bytes at its limit and hands them out from its position.
//! `take` returns a `Bytes` view into the same allocation rather than a copy.
//!
//! Decoders feed partial network reads into a `ByteBuffer` and consume only what a
//! complete state transition needs; the consumed prefix is reclaimed lazily.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Default initial capacity for frame assembly
pub const DEFAULT_CAPACITY: usize = 4 * 1024;

/// Consumed bytes beyond which the prefix is reclaimed on the next write
const COMPACT_THRESHOLD: usize = 16 * 1024;

/// Position/limit byte buffer over `BytesMut`
#[derive(Debug, Default, Clone)]
pub struct ByteBuffer {
    data: BytesMut,
    /// Read cursor; `data[..position]` has been consumed
    position: usize,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self {
            data: BytesMut::with_capacity(DEFAULT_CAPACITY),
            position: 0,
        }
    }

    /// Bytes available between position and limit
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Append a slice at the limit
    #[inline]
    pub fn put_slice(&mut self, src: &[u8]) {
        if self.position >= COMPACT_THRESHOLD || (self.position > 0 && self.is_empty()) {
            self.compact();
        }
        self.data.put_slice(src);
    }

    /// Consume the next byte
    #[inline]
    pub fn get_u8(&mut self) -> Option<u8> {
        let byte = self.data.get(self.position).copied()?;
        self.position += 1;
        Some(byte)
    }

    /// Consume exactly `n` bytes, or `None` if fewer are available
    pub fn take(&mut self, n: usize) -> Option<Bytes> {
        if self.remaining() < n {
            return None;
        }
        self.compact();
        Some(self.data.split_to(n).freeze())
    }

    /// Drop consumed bytes so that position becomes zero
    #[inline]
    fn compact(&mut self) {
        if self.position > 0 {
            self.data.advance(self.position);
            self.position = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_and_take() {
        let mut buf = ByteBuffer::new();
        buf.put_slice(b"abcdef");
        assert_eq!(buf.get_u8(), Some(b'a'));
        assert_eq!(buf.remaining(), 5);

        assert!(buf.take(10).is_none());
        assert_eq!(buf.take(3).unwrap().as_ref(), b"bcd");
        assert_eq!(buf.take(2).unwrap().as_ref(), b"ef");
        assert!(buf.is_empty());
        assert_eq!(buf.get_u8(), None);
    }

    #[test]
    fn test_reuse_after_drain() {
        let mut buf = ByteBuffer::new();
        buf.put_slice(b"ab");
        buf.get_u8();
        buf.get_u8();
        buf.put_slice(&[1, 2]);
        assert_eq!(buf.position, 0);
        assert_eq!(buf.take(2).unwrap().as_ref(), &[1, 2]);
    }

    #[test]
    fn test_partial_reads_accumulate() {
        let mut buf = ByteBuffer::new();
        buf.put_slice(b"he");
        assert!(buf.take(5).is_none());
        buf.put_slice(b"llo");
        assert_eq!(buf.take(5).unwrap().as_ref(), b"hello");
    }
}
