//! Error types for the gateway transport engine

use std::io;

use thiserror::Error;

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Transport error types
///
/// Precondition failures (`InvalidCloseCode`, `InvalidCloseReason`, `InvalidState`) are
/// returned synchronously from the call that violated them and never reach the wire.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying socket or HTTP connection
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
    /// Invalid WebSocket or emulated frame
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
    /// Invalid UTF-8 in a text message
    #[error("invalid UTF-8 in text message")]
    InvalidUtf8,
    /// Protocol violation by the peer
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    /// Connection closed
    #[error("connection closed")]
    ConnectionClosed,
    /// Reassembled message exceeds the configured maximum
    #[error("message too large")]
    MessageTooLarge,
    /// Single frame exceeds the configured maximum
    #[error("frame too large")]
    FrameTooLarge,
    /// Malformed HTTP message
    #[error("invalid HTTP: {0}")]
    InvalidHttp(&'static str),
    /// Handshake failed (wrong status, bad accept key, malformed create response)
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    /// No usable credential for an authentication challenge
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    /// Connection attempt did not open in time
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),
    /// Emulated downstream received nothing within the negotiated idle window
    #[error("idle timeout after {0:?} without data")]
    IdleTimeout(std::time::Duration),
    /// Close code outside 1000 and 3000..=4999
    #[error("invalid close code: {0}")]
    InvalidCloseCode(u16),
    /// Close reason longer than 123 UTF-8 bytes
    #[error("close reason is {0} bytes, at most 123 allowed")]
    InvalidCloseReason(usize),
    /// Negotiated extensions do not match the enabled set
    #[error("extension negotiation failed: {0}")]
    ExtensionNegotiation(String),
    /// Operation not valid in the current ready state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// Unexpected HTTP status from an emulated channel request
    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),
    /// Redirect limit reached or redirect target unusable
    #[error("redirect failed: {0}")]
    Redirect(String),
    /// Invalid URL
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(String),
    /// TLS setup error
    #[error("TLS error: {0}")]
    Tls(String),
}

impl Error {
    /// Whether this error is a local precondition violation rather than a transport failure
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::InvalidCloseCode(_) | Error::InvalidCloseReason(_) | Error::InvalidState(_)
        )
    }
}

/// Close frame reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// No status received
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Mandatory extension
    pub const EXTENSION: u16 = 1010;
    /// Internal server error
    pub const INTERNAL: u16 = 1011;

    /// Maximum reason length in bytes (125 byte control payload minus the status code)
    pub const MAX_REASON_LEN: usize = 123;

    /// Create a new close reason without validation
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Create a close reason for a client-initiated close, validating code and reason
    pub fn client(code: u16, reason: impl Into<String>) -> Result<Self> {
        let reason = reason.into();
        Self::validate_client(code, &reason)?;
        Ok(Self { code, reason })
    }

    /// Validate the arguments of a client-initiated close
    ///
    /// Clients may only send 1000 or an application code in 3000..=4999.
    pub fn validate_client(code: u16, reason: &str) -> Result<()> {
        if code != Self::NORMAL && !(3000..=4999).contains(&code) {
            return Err(Error::InvalidCloseCode(code));
        }
        if reason.len() > Self::MAX_REASON_LEN {
            return Err(Error::InvalidCloseReason(reason.len()));
        }
        Ok(())
    }

    /// Check if a received close code is valid per RFC 6455
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            _ => Error::Io(e),
        }
    }
}

impl From<hyper::Error> for Error {
    fn from(e: hyper::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<http::Error> for Error {
    fn from(e: http::Error) -> Self {
        Error::Http(e.to_string())
    }
}
