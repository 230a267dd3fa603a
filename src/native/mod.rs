//! Native RFC 6455 transport
//!
//! Each connect opens a fresh byte stream through the [`Connector`], performs the gateway
//! upgrade and then runs one session task that owns the socket: it reads frames, answers
//! pings, echoes closes and writes whatever the pipeline sends down.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::Config;
use crate::channel::{Channel, ChannelKind};
use crate::error::CloseReason;
use crate::net::Connector;
use crate::pipeline::{ConnectRequest, Event};
use crate::protocol::Message;
use crate::transport::{Attempts, Command, Transport, TransportKind};

mod session;

pub struct NativeTransport {
    config: Arc<Config>,
    connector: Arc<dyn Connector>,
    parent: Arc<Channel>,
    attempts: Attempts,
}

impl NativeTransport {
    pub fn new(
        config: Arc<Config>,
        connector: Arc<dyn Connector>,
        parent: Arc<Channel>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            config,
            connector,
            parent,
            attempts: Attempts::new(events),
        }
    }
}

impl Transport for NativeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Native
    }

    fn connect(&mut self, request: ConnectRequest) {
        let (sink, commands) = self.attempts.begin();
        let channel = Channel::child(&self.parent, ChannelKind::Native, request.location.clone());
        let config = self.config.clone();
        let connector = self.connector.clone();

        debug!(location = %request.location, "native connect");
        tokio::spawn(async move {
            let token = sink.token().clone();
            tokio::select! {
                _ = token.cancelled() => trace!("native attempt aborted"),
                result = session::run(config, connector, channel, request, &sink, commands) => {
                    if let Err(e) = result {
                        debug!(error = %e, "native session failed");
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
