//! Connection identity and ready state
//!
//! A [`Channel`] is one connection attempt: where it points, what was negotiated and the
//! sequence counter stamped on its requests. Channels form a tree (composite -> native or
//! emulated -> upstream/downstream); children keep a weak link to their parent so the
//! parent alone decides their lifetime.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use url::Url;

use crate::extension::NegotiatedExtension;

/// Connection ready state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }

    /// Whether moving from `self` to `next` is allowed
    pub fn can_transition_to(self, next: ReadyState) -> bool {
        use ReadyState::*;
        matches!(
            (self, next),
            (Connecting, Open) | (Connecting, Closed) | (Open, Closing) | (Open, Closed) | (Closing, Closed)
        )
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReadyState::Connecting => "CONNECTING",
            ReadyState::Open => "OPEN",
            ReadyState::Closing => "CLOSING",
            ReadyState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Lock-free ready state cell enforcing the allowed transitions
#[derive(Debug)]
pub struct ReadyStateCell(AtomicU8);

impl ReadyStateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(ReadyState::Connecting as u8))
    }

    #[inline]
    pub fn get(&self) -> ReadyState {
        ReadyState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next` if allowed from the current state
    ///
    /// Returns the previous state on success. Nothing ever leaves `Closed`.
    pub fn transition(&self, next: ReadyState) -> Option<ReadyState> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let state = ReadyState::from_u8(current);
            if !state.can_transition_to(next) {
                return None;
            }
            match self.0.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(state),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for ReadyStateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Role of a channel in the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Composite,
    Native,
    Emulated,
    Upstream,
    Downstream,
}

/// How a channel that reached CLOSED ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    pub code: u16,
    pub reason: String,
    /// Whether a close handshake completed
    pub was_clean: bool,
}

/// One connection attempt
#[derive(Debug)]
pub struct Channel {
    kind: ChannelKind,
    location: RwLock<Url>,
    protocol: RwLock<Option<String>>,
    extensions: RwLock<Vec<NegotiatedExtension>>,
    sequence: AtomicU64,
    ready_state: ReadyStateCell,
    close_status: RwLock<Option<CloseStatus>>,
    parent: Option<Weak<Channel>>,
}

impl Channel {
    /// Create a root channel
    pub fn new(kind: ChannelKind, location: Url) -> Arc<Self> {
        Arc::new(Self::build(kind, location, 0, None))
    }

    /// Create a child channel whose sequence continues from the parent's counter
    pub fn child(parent: &Arc<Channel>, kind: ChannelKind, location: Url) -> Arc<Self> {
        let start = parent.sequence.load(Ordering::Acquire);
        Arc::new(Self::build(
            kind,
            location,
            start,
            Some(Arc::downgrade(parent)),
        ))
    }

    fn build(kind: ChannelKind, location: Url, sequence: u64, parent: Option<Weak<Channel>>) -> Self {
        Self {
            kind,
            location: RwLock::new(location),
            protocol: RwLock::new(None),
            extensions: RwLock::new(Vec::new()),
            sequence: AtomicU64::new(sequence),
            ready_state: ReadyStateCell::new(),
            close_status: RwLock::new(None),
            parent,
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn location(&self) -> Url {
        self.location.read().clone()
    }

    pub fn set_location(&self, location: Url) {
        *self.location.write() = location;
    }

    pub fn protocol(&self) -> Option<String> {
        self.protocol.read().clone()
    }

    pub fn extensions(&self) -> Vec<NegotiatedExtension> {
        self.extensions.read().clone()
    }

    /// Record the outcome of a successful handshake
    pub fn set_negotiated(&self, protocol: Option<String>, extensions: Vec<NegotiatedExtension>) {
        *self.protocol.write() = protocol;
        *self.extensions.write() = extensions;
    }

    /// Next sequence number for a request on this channel
    #[inline]
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::AcqRel)
    }

    pub fn ready_state(&self) -> ReadyState {
        self.ready_state.get()
    }

    /// See [`ReadyStateCell::transition`]
    pub fn transition(&self, next: ReadyState) -> Option<ReadyState> {
        self.ready_state.transition(next)
    }

    /// Record how the channel ended; the first status wins
    pub fn set_close_status(&self, status: CloseStatus) {
        let mut slot = self.close_status.write();
        if slot.is_none() {
            *slot = Some(status);
        }
    }

    pub fn close_status(&self) -> Option<CloseStatus> {
        self.close_status.read().clone()
    }

    /// The parent channel, if it is still alive
    pub fn parent(&self) -> Option<Arc<Channel>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }
}
