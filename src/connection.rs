//! Connection facade
//!
//! [`WebSocket`] is the caller's handle. It owns no I/O itself: a driver task owns the
//! handler pipeline and the selected transport, and the facade talks to it over
//! channels. `connect` and `close` each wait on a oneshot the driver resolves exactly
//! once.
//!
//! # Example
//!
//! ```ignore
//! use wsgate::prelude::*;
//!
//! let mut ws = WebSocket::builder("ws://gateway.example.com/echo")?
//!     .config(Config::builder().protocols(["chat"]).build())
//!     .build();
//! ws.connect().await?;
//! ws.send(Message::text("hi"))?;
//! if let Some(reply) = ws.recv().await? {
//!     println!("{reply:?}");
//! }
//! ws.close(Some(CloseReason::new(1000, "done"))).await?;
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::channel::{Channel, ChannelKind, CloseStatus, ReadyState};
use crate::emulated::EmulatedTransport;
use crate::emulated::http::{HttpClient, HyperHttpClient};
use crate::error::{CloseReason, Error, Result};
use crate::extension::{ExtensionRegistry, NegotiatedExtension};
use crate::native::NativeTransport;
use crate::net::{Connector, TcpConnector};
use crate::pipeline::{
    AuthenticationStage, ChallengeHandler, ConnectRequest, Dispatch, Event, HandshakeStage,
    Pipeline, RedirectStage, Request, TerminalGuard,
};
use crate::protocol::Message;
use crate::transport::{SelectedTransport, Transport, TransportKind};
use crate::Config;

/// Facade-to-driver commands
enum DriverCommand {
    Connect {
        kind: TransportKind,
        opened: oneshot::Sender<Result<()>>,
    },
    Send(Message),
    Close {
        reason: Option<CloseReason>,
        closed: oneshot::Sender<Result<()>>,
    },
    Authorize(Option<String>),
    Abort,
    /// Start over on a fresh channel after the previous one closed
    Reset {
        channel: Arc<Channel>,
        messages: mpsc::UnboundedSender<Result<Message>>,
    },
}

/// Builder for [`WebSocket`]
pub struct WebSocketBuilder {
    location: Url,
    config: Config,
    connector: Option<Arc<dyn Connector>>,
    http: Option<Arc<dyn HttpClient>>,
    challenge_handler: Option<Arc<dyn ChallengeHandler>>,
    registry: ExtensionRegistry,
}

impl WebSocketBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Byte stream source for the native transport and the default HTTP client
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// HTTP client for the emulated transport
    pub fn http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    /// Answers authentication challenges
    pub fn challenge_handler(mut self, handler: Arc<dyn ChallengeHandler>) -> Self {
        self.challenge_handler = Some(handler);
        self
    }

    /// Extensions the enabled set is checked against
    pub fn extension_registry(mut self, registry: ExtensionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn build(self) -> WebSocket {
        let config = Arc::new(self.config);
        let registry = Arc::new(self.registry);
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector::new()));
        let http = self
            .http
            .unwrap_or_else(|| Arc::new(HyperHttpClient::new(connector.clone())));
        let channel = Channel::new(ChannelKind::Composite, self.location.clone());

        let pipeline = Pipeline::new(vec![
            Box::new(TerminalGuard::new()),
            Box::new(HandshakeStage::new(
                registry.clone(),
                config.extensions.clone(),
            )),
            Box::new(RedirectStage::new(config.max_redirects)),
            Box::new(AuthenticationStage::new(
                self.challenge_handler,
                config.max_authentication_attempts,
            )),
        ]);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            config: config.clone(),
            registry,
            location: self.location.clone(),
            channel: channel.clone(),
            connector,
            http,
            pipeline,
            transport: None,
            events_tx,
            events: events_rx,
            commands: commands_rx,
            messages: Some(messages_tx),
            pending_open: None,
            pending_close: None,
        };

        WebSocket {
            config,
            origin: self.location,
            channel,
            commands: commands_tx,
            messages: messages_rx,
            driver: Some(driver),
        }
    }
}

/// A client connection to a gateway
pub struct WebSocket {
    config: Arc<Config>,
    /// Location given to the builder; reconnects start here
    origin: Url,
    channel: Arc<Channel>,
    commands: mpsc::UnboundedSender<DriverCommand>,
    messages: mpsc::UnboundedReceiver<Result<Message>>,
    /// Spawned on the first `connect`
    driver: Option<Driver>,
}

impl WebSocket {
    /// Start building a connection to a `ws://` or `wss://` URL
    pub fn builder(location: &str) -> Result<WebSocketBuilder> {
        let location = Url::parse(location)?;
        if !matches!(location.scheme(), "ws" | "wss") {
            return Err(Error::InvalidHttp("location must use ws or wss"));
        }
        Ok(WebSocketBuilder {
            location,
            config: Config::default(),
            connector: None,
            http: None,
            challenge_handler: None,
            registry: ExtensionRegistry::new(),
        })
    }

    /// Open the connection
    ///
    /// Tries each transport of the configured strategy in turn. Resolves once, when a
    /// transport opens or every transport has failed; the whole call is bounded by the
    /// connect timeout, after which the half-open attempt is aborted. Connecting again
    /// after the connection has closed starts over on a fresh channel.
    pub async fn connect(&mut self) -> Result<()> {
        match self.driver.take() {
            Some(driver) => {
                tokio::spawn(driver.run());
            }
            None if self.channel.ready_state() == ReadyState::Closed => self.reset()?,
            None => return Err(Error::InvalidState("connect already in progress or open")),
        }

        let deadline = self.config.connect_timeout.map(|t| (Instant::now() + t, t));
        let mut last_error = None;

        for &kind in self.config.strategy.order() {
            debug!(transport = %kind, location = %self.channel.location(), "connecting");
            let result = match deadline {
                Some((at, limit)) => match timeout_at(at, self.attempt(kind)).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(timeout = ?limit, "connect timed out");
                        let _ = self.commands.send(DriverCommand::Abort);
                        self.channel.transition(ReadyState::Closed);
                        return Err(Error::ConnectTimeout(limit));
                    }
                },
                None => self.attempt(kind).await,
            };

            match result {
                Ok(()) => {
                    info!(transport = %kind, protocol = ?self.channel.protocol(), "connected");
                    return Ok(());
                }
                Err(e @ (Error::AuthenticationFailed(_) | Error::ExtensionNegotiation(_))) => {
                    last_error = Some(e);
                    break;
                }
                Err(e) => {
                    warn!(transport = %kind, error = %e, "transport failed");
                    last_error = Some(e);
                }
            }
        }

        self.channel.transition(ReadyState::Closed);
        Err(last_error.unwrap_or(Error::ConnectionClosed))
    }

    fn reset(&mut self) -> Result<()> {
        let channel = Channel::new(ChannelKind::Composite, self.origin.clone());
        let (messages, messages_rx) = mpsc::unbounded_channel();
        self.commands
            .send(DriverCommand::Reset {
                channel: channel.clone(),
                messages,
            })
            .map_err(|_| Error::ConnectionClosed)?;
        debug!(location = %channel.location(), "starting over on a fresh channel");
        self.channel = channel;
        self.messages = messages_rx;
        Ok(())
    }

    async fn attempt(&self, kind: TransportKind) -> Result<()> {
        let (opened, rx) = oneshot::channel();
        self.commands
            .send(DriverCommand::Connect { kind, opened })
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Queue a text or binary message
    pub fn send(&self, message: Message) -> Result<()> {
        if !matches!(message, Message::Text(_) | Message::Binary(_)) {
            return Err(Error::InvalidState("only text and binary messages can be sent"));
        }
        if self.channel.ready_state() != ReadyState::Open {
            return Err(Error::InvalidState("connection is not open"));
        }
        self.commands
            .send(DriverCommand::Send(message))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Next inbound message
    ///
    /// Returns `Ok(None)` once the connection has ended. A connection that fails after
    /// opening yields its error once, before `Ok(None)`.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        self.messages.recv().await.transpose()
    }

    /// Close the connection
    ///
    /// The code and reason are validated before anything is sent. Resolves when the close
    /// handshake completes or, after the close timeout, once the transport is aborted.
    pub async fn close(&mut self, reason: Option<CloseReason>) -> Result<()> {
        if let Some(r) = &reason {
            CloseReason::validate_client(r.code, &r.reason)?;
        }

        match self.channel.ready_state() {
            ReadyState::Closed => return Ok(()),
            ReadyState::Connecting => {
                let _ = self.commands.send(DriverCommand::Abort);
                self.channel.transition(ReadyState::Closed);
                return Ok(());
            }
            ReadyState::Open | ReadyState::Closing => {}
        }
        self.channel.transition(ReadyState::Closing);

        let (closed, rx) = oneshot::channel();
        self.commands
            .send(DriverCommand::Close { reason, closed })
            .map_err(|_| Error::ConnectionClosed)?;

        match timeout(self.config.close_timeout, rx).await {
            Ok(result) => result.map_err(|_| Error::ConnectionClosed)?,
            Err(_) => {
                warn!(timeout = ?self.config.close_timeout, "close timed out, aborting");
                let _ = self.commands.send(DriverCommand::Abort);
                self.channel.set_close_status(CloseStatus {
                    code: CloseReason::ABNORMAL,
                    reason: String::new(),
                    was_clean: false,
                });
                self.channel.transition(ReadyState::Closed);
                Ok(())
            }
        }
    }

    /// Supply a credential for the next connect or challenge
    pub fn authorize(&self, credential: Option<String>) {
        let _ = self.commands.send(DriverCommand::Authorize(credential));
    }

    pub fn ready_state(&self) -> ReadyState {
        self.channel.ready_state()
    }

    /// Sub-protocol negotiated on open
    pub fn protocol(&self) -> Option<String> {
        self.channel.protocol()
    }

    /// Extensions negotiated on open
    pub fn extensions(&self) -> Vec<NegotiatedExtension> {
        self.channel.extensions()
    }

    /// How the connection ended, once it is closed
    ///
    /// A connection that failed after opening reports 1006 and `was_clean == false`.
    pub fn close_status(&self) -> Option<CloseStatus> {
        self.channel.close_status()
    }

    /// Current location, updated by redirects
    pub fn location(&self) -> Url {
        self.channel.location()
    }
}

/// Owns the pipeline and transport for one connection
struct Driver {
    config: Arc<Config>,
    registry: Arc<ExtensionRegistry>,
    location: Url,
    channel: Arc<Channel>,
    connector: Arc<dyn Connector>,
    http: Arc<dyn HttpClient>,
    pipeline: Pipeline,
    transport: Option<SelectedTransport>,
    events_tx: mpsc::UnboundedSender<Event>,
    events: mpsc::UnboundedReceiver<Event>,
    commands: mpsc::UnboundedReceiver<DriverCommand>,
    /// Inbound messages; a failure after open is delivered here once
    messages: Option<mpsc::UnboundedSender<Result<Message>>>,
    pending_open: Option<oneshot::Sender<Result<()>>>,
    pending_close: Option<oneshot::Sender<Result<()>>>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(event) = self.events.recv() => {
                    let dispatch = self.pipeline.event(event);
                    self.dispatch(dispatch);
                }
            }
        }

        trace!("facade dropped, stopping driver");
        if let Some(transport) = &mut self.transport {
            transport.abort();
        }
    }

    fn on_command(&mut self, command: DriverCommand) {
        let request = match command {
            DriverCommand::Connect { kind, opened } => {
                self.transport = Some(self.transport_for(kind));
                self.pending_open = Some(opened);
                Request::Connect(ConnectRequest {
                    location: self.location.clone(),
                    protocols: self.config.protocols.clone(),
                    extensions: None,
                    authorization: None,
                })
            }
            DriverCommand::Send(message) => Request::Send(message),
            DriverCommand::Close { reason, closed } => {
                if self.channel.ready_state() == ReadyState::Closed {
                    let _ = closed.send(Ok(()));
                    return;
                }
                self.pending_close = Some(closed);
                Request::Close(reason)
            }
            DriverCommand::Authorize(credential) => Request::Authorize(credential),
            DriverCommand::Abort => Request::Abort,
            DriverCommand::Reset { channel, messages } => {
                if let Some(mut transport) = self.transport.take() {
                    transport.abort();
                }
                self.channel = channel;
                self.messages = Some(messages);
                self.pending_open = None;
                self.pending_close = None;
                return;
            }
        };
        let dispatch = self.pipeline.request(request);
        self.dispatch(dispatch);
    }

    fn transport_for(&self, kind: TransportKind) -> SelectedTransport {
        match kind {
            TransportKind::Native => SelectedTransport::Native(NativeTransport::new(
                self.config.clone(),
                self.connector.clone(),
                self.channel.clone(),
                self.events_tx.clone(),
            )),
            TransportKind::Emulated => SelectedTransport::Emulated(EmulatedTransport::new(
                self.config.clone(),
                self.http.clone(),
                self.channel.clone(),
                self.events_tx.clone(),
            )),
        }
    }

    fn dispatch(&mut self, dispatch: Dispatch) {
        for request in dispatch.to_transport {
            match &mut self.transport {
                Some(transport) => transport.apply(request),
                None => trace!(request = ?request, "no transport selected"),
            }
        }
        for event in dispatch.to_facade {
            self.deliver(event);
        }
    }

    fn deliver(&mut self, event: Event) {
        match event {
            Event::Opened {
                protocol,
                extensions,
            } => {
                let negotiated = self
                    .registry
                    .negotiate(&self.config.extensions, extensions.as_deref());
                let negotiated = match negotiated {
                    Ok(negotiated) => negotiated,
                    Err(e) => {
                        if let Some(transport) = &mut self.transport {
                            transport.abort();
                        }
                        self.deliver(Event::Failed(e));
                        return;
                    }
                };
                self.channel.set_negotiated(protocol, negotiated);
                self.channel.transition(ReadyState::Open);
                if let Some(opened) = self.pending_open.take() {
                    let _ = opened.send(Ok(()));
                }
            }
            Event::Message(message) => {
                if let Some(messages) = &self.messages {
                    let _ = messages.send(Ok(message));
                }
            }
            Event::Redirected(location) => {
                debug!(location = %location, "connection redirected");
                self.channel.set_location(location);
            }
            Event::AuthenticationRequested {
                location,
                challenge,
            } => {
                debug!(location = %location, challenge = %challenge, "authentication requested");
            }
            Event::Closed {
                code,
                reason,
                was_clean,
            } => {
                info!(code, reason = %reason, was_clean, "connection closed");
                self.channel.set_close_status(CloseStatus {
                    code,
                    reason,
                    was_clean,
                });
                self.channel.transition(ReadyState::Closed);
                self.messages = None;
                if let Some(opened) = self.pending_open.take() {
                    let _ = opened.send(Err(Error::ConnectionClosed));
                }
                if let Some(closed) = self.pending_close.take() {
                    let _ = closed.send(Ok(()));
                }
            }
            Event::Failed(error) => {
                if let Some(opened) = self.pending_open.take() {
                    // the facade may still fall back to another transport
                    let _ = opened.send(Err(error));
                    return;
                }
                warn!(error = %error, "connection failed");
                self.channel.set_close_status(CloseStatus {
                    code: CloseReason::ABNORMAL,
                    reason: String::new(),
                    was_clean: false,
                });
                self.channel.transition(ReadyState::Closed);
                let messages = self.messages.take();
                match (self.pending_close.take(), messages) {
                    (Some(closed), _) => {
                        let _ = closed.send(Err(error));
                    }
                    (None, Some(messages)) => {
                        let _ = messages.send(Err(error));
                    }
                    (None, None) => {}
                }
            }
        }
    }
}
