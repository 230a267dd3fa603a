//! Handler pipeline
//!
//! Requests travel down from the facade to the transport, events travel up from the
//! transport to the facade. In between sits an ordered list of [`Stage`]s. Each stage sees
//! every item passing through it and may forward it, rewrite it, swallow it, or emit new
//! items in either direction.
//!
//! ```text
//! facade
//!   | Request            ^ Event
//!   v                    |
//! [0] TerminalGuard
//! [1] HandshakeStage
//! [2] RedirectStage
//! [3] AuthenticationStage
//!   |                    ^
//!   v                    |
//! transport
//! ```
//!
//! Dispatch is a single FIFO work queue, so items emitted by a stage are processed in
//! the order they were produced.

use std::collections::VecDeque;
use std::fmt;

use url::Url;

use crate::error::{CloseReason, Error};
use crate::protocol::Message;

mod auth;
mod guard;
mod handshake;
mod redirect;

pub use auth::{AuthenticationStage, BasicChallengeHandler, ChallengeHandler};
pub use guard::TerminalGuard;
pub use handshake::HandshakeStage;
pub use redirect::RedirectStage;

/// Parameters of a connection attempt as they reach the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub location: Url,
    /// Requested sub-protocols, in preference order
    pub protocols: Vec<String>,
    /// Serialized enabled extensions
    pub extensions: Option<String>,
    /// Credential for the `Authorization` header
    pub authorization: Option<String>,
}

impl ConnectRequest {
    pub fn new(location: Url) -> Self {
        Self {
            location,
            protocols: Vec::new(),
            extensions: None,
            authorization: None,
        }
    }
}

/// Downward items
#[derive(Debug)]
pub enum Request {
    Connect(ConnectRequest),
    Send(Message),
    /// Close; `None` sends an empty close payload
    Close(Option<CloseReason>),
    /// Supply (or clear) the credential used on the next connect
    Authorize(Option<String>),
    /// Tear the current attempt down without a close handshake
    Abort,
}

/// Upward items
#[derive(Debug)]
pub enum Event {
    Opened {
        protocol: Option<String>,
        extensions: Option<String>,
    },
    Message(Message),
    Redirected(Url),
    AuthenticationRequested {
        location: Url,
        challenge: String,
    },
    Closed {
        code: u16,
        reason: String,
        was_clean: bool,
    },
    Failed(Error),
}

impl Event {
    /// Whether this event ends the current attempt
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Closed { .. } | Event::Failed(_))
    }

    /// Closed event for a connection lost without a close handshake
    pub fn abnormal_close() -> Self {
        Event::Closed {
            code: CloseReason::ABNORMAL,
            reason: String::new(),
            was_clean: false,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Opened { .. } => f.write_str("opened"),
            Event::Message(_) => f.write_str("message"),
            Event::Redirected(url) => write!(f, "redirected({url})"),
            Event::AuthenticationRequested { .. } => f.write_str("authentication requested"),
            Event::Closed { code, .. } => write!(f, "closed({code})"),
            Event::Failed(e) => write!(f, "failed({e})"),
        }
    }
}

/// Items a stage emits while handling one input
#[derive(Debug, Default)]
pub struct Output {
    /// Requests for the stage below
    pub down: Vec<Request>,
    /// Events for the stage above
    pub up: Vec<Event>,
}

impl Output {
    #[inline]
    pub fn forward_request(&mut self, request: Request) {
        self.down.push(request);
    }

    #[inline]
    pub fn forward_event(&mut self, event: Event) {
        self.up.push(event);
    }
}

/// One pipeline stage
pub trait Stage: Send {
    /// Handle a request coming from above
    fn on_request(&mut self, request: Request, out: &mut Output) {
        out.forward_request(request);
    }

    /// Handle an event coming from below
    fn on_event(&mut self, event: Event, out: &mut Output) {
        out.forward_event(event);
    }
}

/// Result of pushing one item through the pipeline
#[derive(Debug, Default)]
pub struct Dispatch {
    /// Requests that fell off the bottom, in order
    pub to_transport: Vec<Request>,
    /// Events that fell off the top, in order
    pub to_facade: Vec<Event>,
}

enum Item {
    Request(Request),
    Event(Event),
}

/// Ordered stage list, index 0 nearest the facade
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// Push a request in from the facade
    pub fn request(&mut self, request: Request) -> Dispatch {
        self.run(0, Item::Request(request))
    }

    /// Push an event in from the transport
    pub fn event(&mut self, event: Event) -> Dispatch {
        let bottom = self.stages.len();
        self.run(bottom, Item::Event(event))
    }

    /// Requests are delivered to stage `at`; events to stage `at - 1`.
    fn run(&mut self, at: usize, item: Item) -> Dispatch {
        let mut dispatch = Dispatch::default();
        let mut queue = VecDeque::new();
        queue.push_back((at, item));

        while let Some((position, item)) = queue.pop_front() {
            let mut out = Output::default();
            match item {
                Item::Request(request) => {
                    if position >= self.stages.len() {
                        dispatch.to_transport.push(request);
                        continue;
                    }
                    self.stages[position].on_request(request, &mut out);
                    Self::route(&mut queue, position, out);
                }
                Item::Event(event) => {
                    if position == 0 {
                        dispatch.to_facade.push(event);
                        continue;
                    }
                    let stage = position - 1;
                    self.stages[stage].on_event(event, &mut out);
                    Self::route(&mut queue, stage, out);
                }
            }
        }

        dispatch
    }

    /// Queue a stage's output: requests to the stage below, events to the stage above
    fn route(queue: &mut VecDeque<(usize, Item)>, stage: usize, out: Output) {
        for request in out.down {
            queue.push_back((stage + 1, Item::Request(request)));
        }
        for event in out.up {
            queue.push_back((stage, Item::Event(event)));
        }
    }
}
