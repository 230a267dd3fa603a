//! Transport abstraction
//!
//! A transport turns the requests that fall off the bottom of the pipeline into I/O and
//! reports what happens as [`Event`]s. Each connect starts a new attempt with its own
//! cancellation token; aborting cancels the token, which stops the attempt's tasks and
//! silences its [`EventSink`], so an aborted attempt never reports again.

use std::fmt;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::emulated::EmulatedTransport;
use crate::error::CloseReason;
use crate::native::NativeTransport;
use crate::pipeline::{ConnectRequest, Event, Request};
use crate::protocol::Message;

/// Which wire protocol a transport speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// RFC 6455 over TCP/TLS
    Native,
    /// Upstream/downstream HTTP channel pair
    Emulated,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Native => write!(f, "native"),
            TransportKind::Emulated => write!(f, "emulated"),
        }
    }
}

/// Operations the pipeline drives on a transport
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Start a new attempt, aborting any previous one
    fn connect(&mut self, request: ConnectRequest);

    /// Queue a message on the current attempt
    fn send(&mut self, message: Message);

    /// Begin the close handshake on the current attempt
    fn close(&mut self, reason: Option<CloseReason>);

    /// Tear the current attempt down; idempotent
    fn abort(&mut self);

    /// Apply a request that reached the bottom of the pipeline
    fn apply(&mut self, request: Request) {
        match request {
            Request::Connect(req) => self.connect(req),
            Request::Send(message) => self.send(message),
            Request::Close(reason) => self.close(reason),
            Request::Abort => self.abort(),
            Request::Authorize(_) => trace!("authorize reached transport, ignoring"),
        }
    }
}

/// Event reporting handle for one attempt
#[derive(Debug, Clone)]
pub struct EventSink {
    events: mpsc::UnboundedSender<Event>,
    token: CancellationToken,
}

impl EventSink {
    pub fn new(events: mpsc::UnboundedSender<Event>, token: CancellationToken) -> Self {
        Self { events, token }
    }

    /// Report an event unless the attempt was aborted
    pub fn emit(&self, event: Event) -> bool {
        if self.token.is_cancelled() {
            trace!(event = %event, "suppressing event from aborted attempt");
            return false;
        }
        self.events.send(event).is_ok()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Commands forwarded to a running attempt
#[derive(Debug)]
pub enum Command {
    Send(Message),
    Close(Option<CloseReason>),
}

struct Attempt {
    token: CancellationToken,
    commands: mpsc::UnboundedSender<Command>,
}

/// Bookkeeping for the current attempt of a transport
pub struct Attempts {
    events: mpsc::UnboundedSender<Event>,
    current: Option<Attempt>,
}

impl Attempts {
    pub fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            events,
            current: None,
        }
    }

    /// Abort the current attempt and start a new one
    pub fn begin(&mut self) -> (EventSink, mpsc::UnboundedReceiver<Command>) {
        self.abort();
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.current = Some(Attempt {
            token: token.clone(),
            commands: tx,
        });
        (EventSink::new(self.events.clone(), token), rx)
    }

    /// Forward a command to the current attempt
    pub fn command(&self, command: Command) {
        match &self.current {
            Some(attempt) if !attempt.token.is_cancelled() => {
                if attempt.commands.send(command).is_err() {
                    trace!("attempt already finished, dropping command");
                }
            }
            _ => warn!(command = ?command, "no active attempt"),
        }
    }

    pub fn abort(&mut self) {
        if let Some(attempt) = self.current.take() {
            attempt.token.cancel();
        }
    }
}

impl Drop for Attempts {
    fn drop(&mut self) {
        self.abort();
    }
}

/// The transport chosen for a connection
pub enum SelectedTransport {
    Native(NativeTransport),
    Emulated(EmulatedTransport),
}

impl Transport for SelectedTransport {
    fn kind(&self) -> TransportKind {
        match self {
            SelectedTransport::Native(t) => t.kind(),
            SelectedTransport::Emulated(t) => t.kind(),
        }
    }

    fn connect(&mut self, request: ConnectRequest) {
        match self {
            SelectedTransport::Native(t) => t.connect(request),
            SelectedTransport::Emulated(t) => t.connect(request),
        }
    }

    fn send(&mut self, message: Message) {
        match self {
            SelectedTransport::Native(t) => t.send(message),
            SelectedTransport::Emulated(t) => t.send(message),
        }
    }

    fn close(&mut self, reason: Option<CloseReason>) {
        match self {
            SelectedTransport::Native(t) => t.close(reason),
            SelectedTransport::Emulated(t) => t.close(reason),
        }
    }

    fn abort(&mut self) {
        match self {
            SelectedTransport::Native(t) => t.abort(),
            SelectedTransport::Emulated(t) => t.abort(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_silenced_after_abort() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut attempts = Attempts::new(tx);
        let (sink, _commands) = attempts.begin();

        assert!(sink.emit(Event::abnormal_close()));
        attempts.abort();
        attempts.abort();
        assert!(sink.is_cancelled());
        assert!(!sink.emit(Event::abnormal_close()));

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_begin_cancels_previous() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut attempts = Attempts::new(tx);
        let (first, _c1) = attempts.begin();
        let (second, mut commands) = attempts.begin();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        attempts.command(Command::Send(Message::text("x")));
        assert!(matches!(commands.try_recv(), Ok(Command::Send(_))));
    }
}
