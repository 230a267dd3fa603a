//! # wsgate: client-side gateway WebSocket transport
//!
//! Connects to a WebSocket gateway over a native RFC 6455 socket or, where sockets are
//! blocked, over an HTTP-emulated channel pair (one upstream POST channel for sends and
//! one long-lived downstream POST for receives).
//!
//! ## Layers
//!
//! - **Codecs**: [`frame`] and [`protocol`] for RFC 6455, [`emulated::codec`] for the
//!   emulated framing, both incremental and tolerant of partial reads
//! - **Pipeline**: [`pipeline`] stages for authentication, negotiation, redirects and
//!   balancer hand-off, exchanging typed [`pipeline::Request`]s and [`pipeline::Event`]s
//! - **Transports**: [`native`] and [`emulated`], selected per connect by a
//!   [`TransportStrategy`]
//! - **Facade**: [`WebSocket`] with async `connect`/`close`, a ready state machine and
//!   the negotiated protocol and extensions
//!
//! ## Example
//!
//! ```ignore
//! use wsgate::{Config, TransportStrategy, WebSocket};
//! use wsgate::prelude::*;
//!
//! let config = Config::builder()
//!     .protocols(["chat"])
//!     .strategy(TransportStrategy::NativeThenEmulated)
//!     .connect_timeout(Duration::from_secs(10))
//!     .build();
//!
//! let mut ws = WebSocket::builder("wss://gateway.example.com/echo")?
//!     .config(config)
//!     .build();
//! ws.connect().await?;
//! ws.send(Message::text("hello"))?;
//! while let Some(msg) = ws.recv().await? {
//!     println!("{msg:?}");
//! }
//! ```

use std::time::Duration;

pub mod balancer;
pub mod buffer;
pub mod channel;
pub mod connection;
pub mod emulated;
pub mod error;
pub mod extension;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod native;
pub mod net;
pub mod pipeline;
pub mod protocol;
pub mod transport;
pub mod utf8;

pub use channel::{CloseStatus, ReadyState};
pub use connection::{WebSocket, WebSocketBuilder};
pub use error::{CloseReason, Error, Result};
pub use extension::{EnabledExtension, ExtensionDescriptor, ExtensionRegistry};
pub use frame::{Frame, OpCode};
pub use protocol::Message;
pub use transport::TransportKind;

/// Default receive buffer size
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Maximum WebSocket frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Largest payload carried by the 7-bit length field
pub const SMALL_MESSAGE_THRESHOLD: usize = 125;

/// Largest payload carried by the 16-bit length field
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// WebSocket GUID for handshake
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Wait for the first downstream response before retrying in proxy mode
pub const DEFAULT_PROXY_FALLBACK_DELAY: Duration = Duration::from_secs(5);

/// Order in which transports are tried by `connect`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportStrategy {
    /// Native socket only
    NativeOnly,
    /// Emulated HTTP channels only
    EmulatedOnly,
    /// Native first, emulated if the native attempt fails
    #[default]
    NativeThenEmulated,
}

impl TransportStrategy {
    /// Transports to try, in order
    pub fn order(&self) -> &'static [TransportKind] {
        match self {
            TransportStrategy::NativeOnly => &[TransportKind::Native],
            TransportStrategy::EmulatedOnly => &[TransportKind::Emulated],
            TransportStrategy::NativeThenEmulated => {
                &[TransportKind::Native, TransportKind::Emulated]
            }
        }
    }
}

/// Connection configuration
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use wsgate::{Config, TransportStrategy};
///
/// let config = Config::builder()
///     .max_message_size(1024 * 1024)
///     .connect_timeout(Duration::from_secs(5))
///     .strategy(TransportStrategy::EmulatedOnly)
///     .build();
/// assert_eq!(config.max_redirects, 5);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum reassembled message size (default: 64MB)
    pub max_message_size: usize,
    /// Maximum single frame size (default: 16MB)
    pub max_frame_size: usize,
    /// Bound on `connect`, `None` waits indefinitely (default: None)
    pub connect_timeout: Option<Duration>,
    /// Bound on `close` before the transport is aborted (default: 5s)
    pub close_timeout: Duration,
    /// Downstream wait before switching to proxy mode (default: 5s)
    pub proxy_fallback_delay: Duration,
    /// Downstream idle timeout when the server sends no `X-Idle-Timeout` (default: None)
    pub default_idle_timeout: Option<Duration>,
    /// Redirects followed per connect, HTTP and balancer combined (default: 5)
    pub max_redirects: u32,
    /// Challenges answered per connect (default: 3)
    pub max_authentication_attempts: u32,
    /// Transport selection (default: native then emulated)
    pub strategy: TransportStrategy,
    /// Requested sub-protocols
    pub protocols: Vec<String>,
    /// Extensions to enable, checked against the registry
    pub extensions: Vec<EnabledExtension>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024 * 1024,
            max_frame_size: 16 * 1024 * 1024,
            connect_timeout: None,
            close_timeout: Duration::from_secs(5),
            proxy_fallback_delay: DEFAULT_PROXY_FALLBACK_DELAY,
            default_idle_timeout: None,
            max_redirects: 5,
            max_authentication_attempts: 3,
            strategy: TransportStrategy::default(),
            protocols: Vec::new(),
            extensions: Vec::new(),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for [`Config`]
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set maximum message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set maximum frame size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Bound `connect` by `timeout`
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = Some(timeout);
        self
    }

    /// Bound `close` by `timeout`
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    /// Set the proxy-mode fallback delay
    pub fn proxy_fallback_delay(mut self, delay: Duration) -> Self {
        self.config.proxy_fallback_delay = delay;
        self
    }

    /// Set the downstream idle timeout used when the server sends none
    pub fn default_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_idle_timeout = Some(timeout);
        self
    }

    /// Set the redirect limit
    pub fn max_redirects(mut self, max: u32) -> Self {
        self.config.max_redirects = max;
        self
    }

    /// Set the authentication attempt limit
    pub fn max_authentication_attempts(mut self, max: u32) -> Self {
        self.config.max_authentication_attempts = max;
        self
    }

    /// Set the transport strategy
    pub fn strategy(mut self, strategy: TransportStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    /// Set the requested sub-protocols
    pub fn protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Enable an extension
    pub fn extension(mut self, extension: EnabledExtension) -> Self {
        self.config.extensions.push(extension);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::channel::{CloseStatus, ReadyState};
    pub use crate::connection::WebSocket;
    pub use crate::error::{CloseReason, Error, Result};
    pub use crate::protocol::Message;
    pub use crate::{Config, TransportStrategy};
    pub use std::time::Duration;
}
