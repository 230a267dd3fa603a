//! HTTP-emulated transport
//!
//! For networks where the upgrade never makes it through, a connection is emulated with
//! plain HTTP:
//!
//! 1. **Create**: `POST <path>/;e/cbm` with the gateway headers. The body names an
//!    upstream and a downstream URL; `Set-Cookie` carries the session cookie.
//! 2. **Downstream** ([`downstream`]): a long-lived streaming POST whose body carries
//!    server frames, re-issued whenever a response completes.
//! 3. **Upstream** ([`upstream`]): queued client frames sent as POST bodies, one POST at
//!    a time.
//!
//! A session task per attempt joins the two: it reports open when the first downstream
//! response begins, forwards messages and drives the close handshake.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use url::Url;

use crate::Config;
use crate::channel::{Channel, ChannelKind, ReadyState};
use crate::error::{CloseReason, Error, Result};
use crate::handshake::HandshakeParams;
use crate::handshake::headers::{X_WEBSOCKET_EXTENSIONS, X_WEBSOCKET_PROTOCOL};
use crate::net::{http_location, websocket_location};
use crate::pipeline::{ConnectRequest, Event};
use crate::protocol::Message;
use crate::transport::{Attempts, Command, EventSink, Transport, TransportKind};

pub mod codec;
pub mod downstream;
pub mod http;
pub mod upstream;

use downstream::Downstream;
use http::{HttpClient, HttpRequest};
use upstream::Upstream;

/// Path suffix of the create request
pub const CREATE_SUFFIX: &str = "/;e/cbm";

/// Largest create response body accepted
const MAX_CREATE_BODY: usize = 4096;

/// What the upstream and downstream report to the session task
#[derive(Debug)]
pub(crate) enum ChannelSignal {
    /// First downstream response began
    Opened,
    Message(Message),
    /// Server close command with its payload
    Close(Option<CloseReason>),
    /// Downstream finished after the client started closing
    Ended,
    Failed(Error),
}

/// State shared by every request of one emulated session
#[derive(Debug)]
pub(crate) struct SessionContext {
    cookie: Option<String>,
}

impl SessionContext {
    pub(crate) fn new(cookie: Option<String>) -> Self {
        Self { cookie }
    }

    /// Attach the session cookie
    pub(crate) fn decorate(&self, request: HttpRequest) -> HttpRequest {
        match &self.cookie {
            Some(cookie) => request.header("Cookie", cookie.clone()),
            None => request,
        }
    }
}

#[derive(Debug)]
struct Created {
    upstream: Url,
    downstream: Url,
    cookie: Option<String>,
    protocol: Option<String>,
    extensions: Option<String>,
}

#[derive(Debug)]
enum CreateOutcome {
    Created(Created),
    AuthenticationRequired(String),
    Redirect(Url),
}

/// URL of the create request for a WebSocket location
fn create_location(location: &Url) -> Result<Url> {
    let mut url = http_location(location)?;
    let path = format!("{}{CREATE_SUFFIX}", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

async fn create(
    http: &dyn HttpClient,
    request: &ConnectRequest,
    sequence: u64,
) -> Result<CreateOutcome> {
    let url = create_location(&request.location)?;
    let params = HandshakeParams {
        protocols: request.protocols.clone(),
        extensions: request.extensions.clone(),
        sequence,
        authorization: request.authorization.clone(),
    };
    let mut req = HttpRequest::post(url.clone());
    for (name, value) in params.gateway_headers() {
        req = req.header(name, value);
    }

    debug!(location = %url, sequence, "emulated create");
    let response = http.execute(req).await?;
    match response.status {
        200 | 201 => {
            let cookie = response
                .header("Set-Cookie")
                .map(|c| c.split(';').next().unwrap_or_default().trim().to_string());
            let protocol = response.header(X_WEBSOCKET_PROTOCOL).map(str::to_string);
            let extensions = response.header(X_WEBSOCKET_EXTENSIONS).map(str::to_string);

            let body = response.collect(MAX_CREATE_BODY).await?;
            let text = std::str::from_utf8(&body)
                .map_err(|_| Error::HandshakeFailed("create response is not UTF-8".into()))?;
            let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
            let (Some(up), Some(down)) = (lines.next(), lines.next()) else {
                return Err(Error::HandshakeFailed(
                    "create response must name upstream and downstream".into(),
                ));
            };

            Ok(CreateOutcome::Created(Created {
                upstream: url.join(up)?,
                downstream: url.join(down)?,
                cookie,
                protocol,
                extensions,
            }))
        }
        401 => Ok(CreateOutcome::AuthenticationRequired(
            response.header("WWW-Authenticate").unwrap_or_default().to_string(),
        )),
        300..=399 => {
            let location = response
                .header("Location")
                .ok_or_else(|| Error::HandshakeFailed("redirect without Location".into()))?;
            let mut target = url.join(location)?;
            if let Some(stripped) = target.path().strip_suffix(CREATE_SUFFIX) {
                let path = if stripped.is_empty() { "/" } else { stripped }.to_string();
                target.set_path(&path);
            }
            Ok(CreateOutcome::Redirect(websocket_location(
                &request.location,
                target.as_str(),
            )?))
        }
        status => Err(Error::HttpStatus(status)),
    }
}

pub struct EmulatedTransport {
    config: Arc<Config>,
    http: Arc<dyn HttpClient>,
    parent: Arc<Channel>,
    attempts: Attempts,
}

impl EmulatedTransport {
    pub fn new(
        config: Arc<Config>,
        http: Arc<dyn HttpClient>,
        parent: Arc<Channel>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            config,
            http,
            parent,
            attempts: Attempts::new(events),
        }
    }
}

impl Transport for EmulatedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Emulated
    }

    fn connect(&mut self, request: ConnectRequest) {
        let (sink, commands) = self.attempts.begin();
        let channel = Channel::child(&self.parent, ChannelKind::Emulated, request.location.clone());
        let config = self.config.clone();
        let http = self.http.clone();

        debug!(location = %request.location, "emulated connect");
        tokio::spawn(async move {
            let token = sink.token().clone();
            tokio::select! {
                _ = token.cancelled() => trace!("emulated attempt aborted"),
                result = session(config, http, channel, request, &sink, commands) => {
                    if let Err(e) = result {
                        debug!(error = %e, "emulated session failed");
                        sink.emit(Event::Failed(e));
                    }
                }
            }
        });
    }

    fn send(&mut self, message: Message) {
        self.attempts.command(Command::Send(message));
    }

    fn close(&mut self, reason: Option<CloseReason>) {
        self.attempts.command(Command::Close(reason));
    }

    fn abort(&mut self) {
        self.attempts.abort();
    }
}

async fn session(
    config: Arc<Config>,
    http: Arc<dyn HttpClient>,
    channel: Arc<Channel>,
    request: ConnectRequest,
    sink: &EventSink,
    mut commands: mpsc::UnboundedReceiver<Command>,
) -> Result<()> {
    let created = match create(http.as_ref(), &request, channel.next_sequence()).await? {
        CreateOutcome::Created(created) => created,
        CreateOutcome::AuthenticationRequired(challenge) => {
            debug!(location = %request.location, "create challenged");
            sink.emit(Event::AuthenticationRequested {
                location: request.location,
                challenge,
            });
            return Ok(());
        }
        CreateOutcome::Redirect(location) => {
            debug!(location = %request.location, target = %location, "create redirected");
            sink.emit(Event::Redirected(location));
            return Ok(());
        }
    };
    debug!(upstream = %created.upstream, downstream = %created.downstream, "emulated channels created");

    let context = Arc::new(SessionContext::new(created.cookie));
    let (signals_tx, mut signals) = mpsc::unbounded_channel();
    let closing = Arc::new(AtomicBool::new(false));

    // the upstream outlives the session so a close echo still goes out
    let upstream = Upstream::new(
        http.clone(),
        context.clone(),
        Channel::child(&channel, ChannelKind::Upstream, created.upstream),
        signals_tx.clone(),
        sink.token().clone(),
    );
    let downstream = Downstream {
        http,
        config,
        context,
        channel: Channel::child(&channel, ChannelKind::Downstream, created.downstream),
        upstream: upstream.clone(),
        closing: closing.clone(),
        signals: signals_tx,
    };
    let downstream_token = sink.token().child_token();
    let _downstream_guard = downstream_token.clone().drop_guard();
    tokio::spawn(async move {
        tokio::select! {
            _ = downstream_token.cancelled() => trace!("downstream stopped"),
            _ = downstream.run() => {}
        }
    });

    let mut sent_close: Option<CloseReason> = None;
    let mut commands_open = true;
    loop {
        tokio::select! {
            signal = signals.recv() => match signal {
                Some(ChannelSignal::Opened) => {
                    channel.transition(ReadyState::Open);
                    debug!(protocol = ?created.protocol, "emulated channel open");
                    sink.emit(Event::Opened {
                        protocol: created.protocol.clone(),
                        extensions: created.extensions.clone(),
                    });
                }
                Some(ChannelSignal::Message(message)) => {
                    sink.emit(Event::Message(message));
                }
                Some(ChannelSignal::Close(reason)) => {
                    if !closing.swap(true, Ordering::AcqRel) {
                        trace!("echoing server close");
                        upstream.send(&Message::Close(reason.clone()));
                    }
                    let (code, reason) = match reason {
                        Some(r) => (r.code, r.reason),
                        None => (CloseReason::NO_STATUS, String::new()),
                    };
                    finish(&channel, sink, code, reason);
                    return Ok(());
                }
                Some(ChannelSignal::Ended) => {
                    let (code, reason) = match sent_close.take() {
                        Some(r) => (r.code, r.reason),
                        None => (CloseReason::NO_STATUS, String::new()),
                    };
                    finish(&channel, sink, code, reason);
                    return Ok(());
                }
                Some(ChannelSignal::Failed(e)) => return Err(e),
                None => return Err(Error::ConnectionClosed),
            },
            command = commands.recv(), if commands_open => match command {
                Some(Command::Send(message)) => {
                    if closing.load(Ordering::Acquire) {
                        warn!("dropping message sent while closing");
                    } else {
                        upstream.send(&message);
                    }
                }
                Some(Command::Close(reason)) => {
                    if closing.swap(true, Ordering::AcqRel) {
                        trace!("close already in progress");
                    } else {
                        debug!(code = ?reason.as_ref().map(|r| r.code), "emulated close sent");
                        upstream.send(&Message::Close(reason.clone()));
                        channel.transition(ReadyState::Closing);
                        sent_close = reason;
                    }
                }
                None => commands_open = false,
            },
        }
    }
}

fn finish(channel: &Channel, sink: &EventSink, code: u16, reason: String) {
    channel.transition(ReadyState::Closed);
    debug!(code, "emulated channel closed");
    sink.emit(Event::Closed {
        code,
        reason,
        was_clean: true,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulated::http::testing::{ChannelHttpClient, Reply, response, streaming};
    use bytes::{Bytes, BytesMut};

    fn transport() -> (
        EmulatedTransport,
        mpsc::UnboundedReceiver<(HttpRequest, Reply)>,
        mpsc::UnboundedReceiver<Event>,
    ) {
        let (http, requests) = ChannelHttpClient::new();
        let (tx, events) = mpsc::unbounded_channel();
        let parent = Channel::new(ChannelKind::Composite, location());
        let transport = EmulatedTransport::new(Arc::new(Config::default()), http, parent, tx);
        (transport, requests, events)
    }

    fn location() -> Url {
        Url::parse("ws://gw.example.com/echo").unwrap()
    }

    fn connect_request() -> ConnectRequest {
        let mut req = ConnectRequest::new(location());
        req.protocols = vec!["chat".into()];
        req
    }

    fn encoded(messages: &[Message]) -> Bytes {
        let mut buf = BytesMut::new();
        for m in messages {
            codec::encode_message(&mut buf, m);
        }
        buf.freeze()
    }

    /// Answer the create request and return the pending downstream request
    async fn open(
        requests: &mut mpsc::UnboundedReceiver<(HttpRequest, Reply)>,
    ) -> (HttpRequest, Reply) {
        let (create, reply) = requests.recv().await.unwrap();
        assert_eq!(create.url.as_str(), "http://gw.example.com/echo/;e/cbm");
        assert_eq!(create.header_value("X-WebSocket-Protocol"), Some("chat"));
        assert_eq!(create.header_value("X-WebSocket-Version"), Some("wseb-1.0"));
        assert_eq!(create.header_value("X-Sequence"), Some("0"));
        reply
            .send(Ok(response(
                201,
                &[("Set-Cookie", "sid=abc; Path=/"), ("X-WebSocket-Protocol", "chat")],
                b"/up/1\n/down/1\n",
            )))
            .unwrap();
        requests.recv().await.unwrap()
    }

    #[tokio::test]
    async fn test_client_initiated_close() {
        let (mut transport, mut requests, mut events) = transport();
        transport.connect(connect_request());

        let (down, reply) = open(&mut requests).await;
        assert_eq!(down.url.as_str(), "http://gw.example.com/down/1");
        assert_eq!(down.header_value("Cookie"), Some("sid=abc"));
        assert_eq!(down.header_value("X-Sequence"), Some("1"));

        let (body, resp) = streaming(200, &[]);
        reply.send(Ok(resp)).unwrap();
        match events.recv().await.unwrap() {
            Event::Opened { protocol, .. } => assert_eq!(protocol.as_deref(), Some("chat")),
            other => panic!("expected opened, got {other}"),
        }

        body.send(Ok(encoded(&[Message::text("hello")]))).unwrap();
        match events.recv().await.unwrap() {
            Event::Message(m) => assert_eq!(m.as_text(), Some("hello")),
            other => panic!("expected message, got {other}"),
        }

        transport.send(Message::text("up"));
        let (up, reply) = requests.recv().await.unwrap();
        assert_eq!(up.url.as_str(), "http://gw.example.com/up/1");
        assert!(up.body.starts_with(&encoded(&[Message::text("up")])));
        reply.send(Ok(response(200, &[], b""))).unwrap();

        transport.close(Some(CloseReason::new(1000, "bye")));
        let (close, _reply) = requests.recv().await.unwrap();
        let expected = encoded(&[Message::Close(Some(CloseReason::new(1000, "bye")))]);
        assert!(close.body.starts_with(&expected));

        // server ends the downstream instead of echoing
        drop(body);
        match events.recv().await.unwrap() {
            Event::Closed {
                code,
                reason,
                was_clean,
            } => {
                assert_eq!(code, 1000);
                assert_eq!(reason, "bye");
                assert!(was_clean);
            }
            other => panic!("expected closed, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_server_close_is_echoed() {
        let (mut transport, mut requests, mut events) = transport();
        transport.connect(connect_request());

        let (_, reply) = open(&mut requests).await;
        let (body, resp) = streaming(200, &[]);
        reply.send(Ok(resp)).unwrap();
        assert!(matches!(events.recv().await.unwrap(), Event::Opened { .. }));

        let close = encoded(&[Message::Close(Some(CloseReason::new(1001, "away")))]);
        body.send(Ok(close.clone())).unwrap();
        match events.recv().await.unwrap() {
            Event::Closed { code, was_clean, .. } => {
                assert_eq!(code, 1001);
                assert!(was_clean);
            }
            other => panic!("expected closed, got {other}"),
        }

        let (echo, _reply) = requests.recv().await.unwrap();
        assert_eq!(echo.url.path(), "/up/1");
        assert!(echo.body.starts_with(&close));
    }

    #[tokio::test]
    async fn test_create_challenge() {
        let (mut transport, mut requests, mut events) = transport();
        transport.connect(connect_request());

        let (_, reply) = requests.recv().await.unwrap();
        reply
            .send(Ok(response(401, &[("WWW-Authenticate", "Basic realm=\"gw\"")], b"")))
            .unwrap();
        match events.recv().await.unwrap() {
            Event::AuthenticationRequested {
                location: l,
                challenge,
            } => {
                assert_eq!(l, location());
                assert_eq!(challenge, "Basic realm=\"gw\"");
            }
            other => panic!("expected challenge, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_create_redirect() {
        let (mut transport, mut requests, mut events) = transport();
        transport.connect(connect_request());

        let (_, reply) = requests.recv().await.unwrap();
        reply
            .send(Ok(response(
                302,
                &[("Location", "https://node2.example.com/echo/;e/cbm")],
                b"",
            )))
            .unwrap();
        match events.recv().await.unwrap() {
            Event::Redirected(url) => assert_eq!(url.as_str(), "wss://node2.example.com/echo"),
            other => panic!("expected redirect, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_create_body_fails() {
        let (mut transport, mut requests, mut events) = transport();
        transport.connect(connect_request());

        let (_, reply) = requests.recv().await.unwrap();
        reply.send(Ok(response(200, &[], b"/up/only"))).unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            Event::Failed(Error::HandshakeFailed(_))
        ));
    }

    #[test]
    fn test_create_location() {
        let url = create_location(&Url::parse("wss://gw:9443/app/").unwrap()).unwrap();
        assert_eq!(url.as_str(), "https://gw:9443/app/;e/cbm");
        let url = create_location(&Url::parse("ws://gw/").unwrap()).unwrap();
        assert_eq!(url.as_str(), "http://gw/;e/cbm");
    }
}
