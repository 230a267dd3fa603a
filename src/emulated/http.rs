//! HTTP client seam for the emulated transport
//!
//! The emulated channels only need "send a request, stream the response body". The
//! default [`HyperHttpClient`] opens one HTTP/1.1 connection per request through a
//! [`Connector`], so each downstream long-poll and each upstream POST gets its own
//! connection and can be torn down independently.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt;
use http::header::{self, HeaderMap};
use http_body_util::{BodyStream, Full};
use hyper_util::rt::TokioIo;
use tracing::{trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::net::{Connector, TcpConnector, authority, request_target};

/// Streaming response body
pub type Body = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Outgoing request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: http::Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn post(url: Url) -> Self {
        Self {
            method: http::Method::POST,
            url,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header, matched case-insensitively
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Response head plus a streaming body
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Body,
}

impl HttpResponse {
    /// A header value as a string, if present and visible ASCII
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Read the whole body, failing if it exceeds `limit` bytes
    pub async fn collect(mut self, limit: usize) -> Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            let chunk = chunk?;
            if out.len() + chunk.len() > limit {
                return Err(Error::InvalidHttp("response body too large"));
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Executes HTTP requests for the emulated transport
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send `request` and return as soon as the response head arrives
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// hyper HTTP/1.1 client, one connection per request
#[derive(Clone)]
pub struct HyperHttpClient {
    connector: Arc<dyn Connector>,
}

impl HyperHttpClient {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }
}

impl Default for HyperHttpClient {
    fn default() -> Self {
        Self::new(Arc::new(TcpConnector::new()))
    }
}

#[async_trait]
impl HttpClient for HyperHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let stream = self.connector.connect(&request.url).await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                trace!(error = %e, "HTTP connection ended");
            }
        });

        let mut builder = http::Request::builder()
            .method(request.method.clone())
            .uri(request_target(&request.url))
            .header(header::HOST, authority(&request.url)?);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let req = builder.body(Full::new(request.body))?;

        let response = sender.send_request(req).await?;
        let status = response.status().as_u16();
        let (parts, incoming) = response.into_parts();

        let body = BodyStream::new(incoming).filter_map(|frame| async move {
            match frame {
                Ok(frame) => frame.into_data().ok().map(Ok),
                Err(e) => {
                    warn!(error = %e, "response body failed");
                    Some(Err(Error::from(e)))
                }
            }
        });

        Ok(HttpResponse {
            status,
            headers: parts.headers,
            body: Box::pin(body),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted HTTP client: every request is handed to the test, which answers it

    use super::*;
    use parking_lot::Mutex;
    use tokio::sync::{mpsc, oneshot};

    pub type Reply = oneshot::Sender<Result<HttpResponse>>;

    pub struct ChannelHttpClient {
        requests: mpsc::UnboundedSender<(HttpRequest, Reply)>,
        pub seen: Mutex<Vec<HttpRequest>>,
    }

    impl ChannelHttpClient {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(HttpRequest, Reply)>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let client = Arc::new(Self {
                requests: tx,
                seen: Mutex::new(Vec::new()),
            });
            (client, rx)
        }
    }

    #[async_trait]
    impl HttpClient for ChannelHttpClient {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
            self.seen.lock().push(request.clone());
            let (tx, rx) = oneshot::channel();
            self.requests
                .send((request, tx))
                .map_err(|_| Error::ConnectionClosed)?;
            rx.await.map_err(|_| Error::ConnectionClosed)?
        }
    }

    /// Response with a fixed body
    pub fn response(status: u16, headers: &[(&str, &str)], body: &'static [u8]) -> HttpResponse {
        let (tx, body_stream) = streaming_body();
        if !body.is_empty() {
            let _ = tx.send(Ok(Bytes::from_static(body)));
        }
        with_body(status, headers, body_stream)
    }

    /// Response whose body is fed by the returned sender; dropping it ends the body
    pub fn streaming(
        status: u16,
        headers: &[(&str, &str)],
    ) -> (mpsc::UnboundedSender<Result<Bytes>>, HttpResponse) {
        let (tx, body) = streaming_body();
        (tx, with_body(status, headers, body))
    }

    fn with_body(status: u16, headers: &[(&str, &str)], body: Body) -> HttpResponse {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(
                http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                http::HeaderValue::from_str(value).unwrap(),
            );
        }
        HttpResponse {
            status,
            headers: map,
            body,
        }
    }

    fn streaming_body() -> (mpsc::UnboundedSender<Result<Bytes>>, Body) {
        let (tx, rx) = mpsc::unbounded_channel();
        let body = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        (tx, Box::pin(body))
    }
}
