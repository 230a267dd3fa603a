//! Gateway upgrade handshake
//!
//! Builds the HTTP/1.1 upgrade request for the native transport, including the gateway
//! headers that the emulated create request shares, and classifies the response into
//! accepted (101), authentication required (401) or redirected (3xx).

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::WS_GUID;
use crate::error::{Error, Result};

/// Maximum HTTP header size (8KB should be enough for any reasonable response)
const MAX_HEADER_SIZE: usize = 8192;

/// Gateway protocol version advertised on every handshake
pub const GATEWAY_VERSION: &str = "wseb-1.0";

/// Header names shared by the native upgrade and the emulated create request
pub mod headers {
    pub const X_WEBSOCKET_PROTOCOL: &str = "X-WebSocket-Protocol";
    pub const X_WEBSOCKET_EXTENSIONS: &str = "X-WebSocket-Extensions";
    pub const X_WEBSOCKET_VERSION: &str = "X-WebSocket-Version";
    pub const X_ACCEPT_COMMANDS: &str = "X-Accept-Commands";
    pub const X_SEQUENCE: &str = "X-Sequence";
    pub const X_IDLE_TIMEOUT: &str = "X-Idle-Timeout";
}

/// Parameters of one handshake attempt
#[derive(Debug, Clone, Default)]
pub struct HandshakeParams {
    /// Requested sub-protocols, in preference order
    pub protocols: Vec<String>,
    /// Serialized enabled extensions
    pub extensions: Option<String>,
    /// Sequence number of this request on its channel
    pub sequence: u64,
    /// Credential answering a previous challenge
    pub authorization: Option<String>,
}

impl HandshakeParams {
    /// Gateway headers carried by both transports
    pub fn gateway_headers(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::with_capacity(6);
        if !self.protocols.is_empty() {
            out.push((headers::X_WEBSOCKET_PROTOCOL, self.protocols.join(", ")));
        }
        if let Some(ext) = self.extensions.as_deref().filter(|e| !e.is_empty()) {
            out.push((headers::X_WEBSOCKET_EXTENSIONS, ext.to_string()));
        }
        out.push((headers::X_WEBSOCKET_VERSION, GATEWAY_VERSION.to_string()));
        out.push((headers::X_ACCEPT_COMMANDS, "ping".to_string()));
        out.push((headers::X_SEQUENCE, self.sequence.to_string()));
        if let Some(auth) = &self.authorization {
            out.push(("Authorization", auth.clone()));
        }
        out
    }
}

/// Generate the Sec-WebSocket-Accept key
///
/// This computes: Base64(SHA-1(key + GUID))
#[inline]
pub fn generate_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Validate the server's accept key
pub fn validate_accept_key(sent_key: &str, received_accept: &str) -> bool {
    generate_accept_key(sent_key) == received_accept
}

/// Generate a random WebSocket key (16 random bytes, base64)
pub fn generate_key() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Build a native upgrade request
///
/// `host` is the authority (with port when non-default), `path` includes the query.
pub fn build_request(host: &str, path: &str, key: &str, params: &HandshakeParams) -> Bytes {
    let mut buf = BytesMut::with_capacity(512);

    buf.put_slice(b"GET ");
    buf.put_slice(path.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");
    put_header(&mut buf, "Host", host);
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    put_header(&mut buf, "Sec-WebSocket-Key", key);
    buf.put_slice(b"Sec-WebSocket-Version: 13\r\n");

    if !params.protocols.is_empty() {
        put_header(&mut buf, "Sec-WebSocket-Protocol", &params.protocols.join(", "));
    }
    for (name, value) in params.gateway_headers() {
        put_header(&mut buf, name, &value);
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

#[inline]
fn put_header(buf: &mut BytesMut, name: &str, value: &str) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value.as_bytes());
    buf.put_slice(b"\r\n");
}

/// Parsed upgrade response
#[derive(Debug, Clone, Default)]
pub struct HandshakeResponse {
    /// HTTP status code
    pub status: u16,
    /// The Sec-WebSocket-Accept header
    pub accept: Option<String>,
    /// Negotiated sub-protocol (standard or gateway header)
    pub protocol: Option<String>,
    /// Negotiated extensions (standard or gateway header)
    pub extensions: Option<String>,
    /// WWW-Authenticate challenge on 401
    pub challenge: Option<String>,
    /// Location on 3xx
    pub location: Option<String>,
}

/// What the caller should do with a handshake response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// 101 with a valid accept key
    Accepted {
        protocol: Option<String>,
        extensions: Option<String>,
    },
    /// 401 with a challenge
    AuthenticationRequired { challenge: String },
    /// 3xx with a Location
    Redirect { location: String },
}

impl HandshakeResponse {
    /// Classify this response for the request that used `key`
    pub fn outcome(&self, key: &str) -> Result<UpgradeOutcome> {
        match self.status {
            101 => {
                let accept = self
                    .accept
                    .as_deref()
                    .ok_or_else(|| Error::HandshakeFailed("missing Sec-WebSocket-Accept".into()))?;
                if !validate_accept_key(key, accept) {
                    return Err(Error::HandshakeFailed("invalid Sec-WebSocket-Accept".into()));
                }
                Ok(UpgradeOutcome::Accepted {
                    protocol: self.protocol.clone(),
                    extensions: self.extensions.clone(),
                })
            }
            401 => Ok(UpgradeOutcome::AuthenticationRequired {
                challenge: self.challenge.clone().unwrap_or_default(),
            }),
            301 | 302 | 303 | 307 | 308 => {
                let location = self
                    .location
                    .clone()
                    .ok_or_else(|| Error::HandshakeFailed("redirect without Location".into()))?;
                Ok(UpgradeOutcome::Redirect { location })
            }
            status => Err(Error::HandshakeFailed(format!(
                "expected 101 Switching Protocols, got {status}"
            ))),
        }
    }
}

/// Parse an upgrade response
///
/// Returns the parsed response and the number of bytes consumed, or `None` while the
/// header block is incomplete.
pub fn parse_response(buf: &[u8]) -> Result<Option<(HandshakeResponse, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut res = httparse::Response::new(&mut headers);

    match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let mut response = HandshakeResponse {
                status: res.code.unwrap_or(0),
                ..Default::default()
            };

            for header in res.headers.iter() {
                let value = std::str::from_utf8(header.value)
                    .map_err(|_| Error::InvalidHttp("invalid header value"))?
                    .trim()
                    .to_string();

                match header.name.to_ascii_lowercase().as_str() {
                    "sec-websocket-accept" => response.accept = Some(value),
                    "sec-websocket-protocol" | "x-websocket-protocol" => {
                        response.protocol.get_or_insert(value);
                    }
                    "sec-websocket-extensions" | "x-websocket-extensions" => {
                        response.extensions.get_or_insert(value);
                    }
                    "www-authenticate" => response.challenge = Some(value),
                    "location" => response.location = Some(value),
                    _ => {}
                }
            }

            Ok(Some((response, len)))
        }
        Ok(httparse::Status::Partial) => {
            if buf.len() > MAX_HEADER_SIZE {
                return Err(Error::InvalidHttp("response too large"));
            }
            Ok(None)
        }
        Err(_) => Err(Error::InvalidHttp("failed to parse HTTP response")),
    }
}

/// Result of a client handshake exchange
#[derive(Debug)]
pub struct HandshakeResult {
    /// Parsed response head
    pub response: HandshakeResponse,
    /// Bytes received after the response head (early frames)
    pub leftover: Option<Bytes>,
}

/// Send an upgrade request and read the response head
pub async fn client_handshake<S>(stream: &mut S, request: &[u8]) -> Result<HandshakeResult>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(request).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(4096);

    loop {
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }

        if let Some((response, consumed)) = parse_response(&buf)? {
            let leftover = if consumed < buf.len() {
                Some(buf.split_off(consumed).freeze())
            } else {
                None
            };
            return Ok(HandshakeResult { response, leftover });
        }
    }
}
