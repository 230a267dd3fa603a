//! Byte stream establishment
//!
//! Both transports reach the gateway through a [`Connector`]. The default
//! [`TcpConnector`] resolves the URL's host, opens a TCP socket and wraps it in TLS for
//! `wss://` and `https://`. Tests substitute in-memory streams.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};

/// Any bidirectional byte stream a transport can run over
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> IoStream for T {}

/// Type-erased stream handed out by connectors
pub type BoxedStream = Box<dyn IoStream>;

/// Opens byte streams to a URL's authority
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect to the host and port of `url`, with TLS when the scheme is secure
    async fn connect(&self, url: &Url) -> Result<BoxedStream>;
}

/// Whether a URL uses a TLS scheme
pub fn is_secure(url: &Url) -> bool {
    matches!(url.scheme(), "wss" | "https")
}

/// Host header value: host plus port when it is not the scheme default
pub fn authority(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or(Error::InvalidHttp("URL has no host"))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Path and query of a URL, as written on the request line
pub fn request_target(url: &Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{q}", url.path()),
        None => url.path().to_string(),
    }
}

/// Resolve a redirect `location` against `base` and give it a WebSocket scheme
pub fn websocket_location(base: &Url, location: &str) -> Result<Url> {
    let mut url = base.join(location)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(Error::Redirect(format!("unsupported redirect scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| Error::Redirect(format!("cannot redirect to {location}")))?;
    Ok(url)
}

/// The HTTP equivalent of a WebSocket URL (`ws` to `http`, `wss` to `https`)
pub fn http_location(url: &Url) -> Result<Url> {
    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        _ => return Err(Error::InvalidHttp("unsupported URL scheme")),
    };
    let mut url = url.clone();
    url.set_scheme(scheme)
        .map_err(|_| Error::InvalidHttp("unsupported URL scheme"))?;
    Ok(url)
}

fn default_port(url: &Url) -> Option<u16> {
    url.port().or(match url.scheme() {
        "ws" | "http" => Some(80),
        "wss" | "https" => Some(443),
        _ => None,
    })
}

pin_project! {
    /// A plain or TLS-wrapped stream
    #[project = MaybeTlsProj]
    pub enum MaybeTlsStream<S> {
        Plain { #[pin] inner: S },
        Tls { #[pin] inner: TlsStream<S> },
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for MaybeTlsStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeTlsProj::Plain { inner } => inner.poll_read(cx, buf),
            MaybeTlsProj::Tls { inner } => inner.poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for MaybeTlsStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            MaybeTlsProj::Plain { inner } => inner.poll_write(cx, buf),
            MaybeTlsProj::Tls { inner } => inner.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeTlsProj::Plain { inner } => inner.poll_flush(cx),
            MaybeTlsProj::Tls { inner } => inner.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeTlsProj::Plain { inner } => inner.poll_shutdown(cx),
            MaybeTlsProj::Tls { inner } => inner.poll_shutdown(cx),
        }
    }
}

/// TCP connector with rustls for secure schemes
#[derive(Clone)]
pub struct TcpConnector {
    tls: Option<TlsConnector>,
}

impl TcpConnector {
    /// Connector trusting the webpki root set
    pub fn new() -> Self {
        Self { tls: None }
    }

    /// Connector using a caller-supplied TLS configuration
    pub fn with_tls(tls: TlsConnector) -> Self {
        Self { tls: Some(tls) }
    }

    fn tls(&self) -> Result<TlsConnector> {
        match &self.tls {
            Some(tls) => Ok(tls.clone()),
            None => tls_connector(),
        }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, url: &Url) -> Result<BoxedStream> {
        let host = url
            .host_str()
            .ok_or(Error::InvalidHttp("URL has no host"))?
            .to_string();
        let port = default_port(url).ok_or(Error::InvalidHttp("unsupported URL scheme"))?;

        let tcp = TcpStream::connect((host.as_str(), port)).await?;
        tcp.set_nodelay(true)?;
        debug!(host = %host, port, secure = is_secure(url), "TCP connected");

        if !is_secure(url) {
            return Ok(Box::new(MaybeTlsStream::Plain { inner: tcp }));
        }

        let domain = ServerName::try_from(host)
            .map_err(|_| Error::Tls("invalid DNS name".into()))?;
        let tls = self.tls()?.connect(domain, tcp).await?;
        Ok(Box::new(MaybeTlsStream::Tls { inner: tls }))
    }
}

/// Build a TLS connector over the webpki roots
fn tls_connector() -> Result<TlsConnector> {
    let mut root_cert_store = rustls::RootCertStore::empty();
    root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authority_and_target() {
        let url = Url::parse("wss://gw.example.com:9443/path/x?a=b").unwrap();
        assert!(is_secure(&url));
        assert_eq!(authority(&url).unwrap(), "gw.example.com:9443");
        assert_eq!(request_target(&url), "/path/x?a=b");

        let url = Url::parse("ws://gw.example.com/").unwrap();
        assert!(!is_secure(&url));
        assert_eq!(authority(&url).unwrap(), "gw.example.com");
        assert_eq!(default_port(&url), Some(80));
    }

    #[test]
    fn test_scheme_mapping() {
        let base = Url::parse("ws://gw.example.com/echo").unwrap();
        let url = websocket_location(&base, "https://node2.example.com/echo").unwrap();
        assert_eq!(url.as_str(), "wss://node2.example.com/echo");
        let url = websocket_location(&base, "/other").unwrap();
        assert_eq!(url.as_str(), "ws://gw.example.com/other");
        assert!(websocket_location(&base, "ftp://x/").is_err());

        let url = http_location(&Url::parse("wss://gw:9443/a?b=c").unwrap()).unwrap();
        assert_eq!(url.as_str(), "https://gw:9443/a?b=c");
    }

    #[tokio::test]
    async fn test_plain_stream_passthrough() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (a, mut b) = tokio::io::duplex(64);
        let mut stream = MaybeTlsStream::Plain { inner: a };
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
