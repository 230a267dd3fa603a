use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::channel::{Channel, ReadyState};
use crate::error::{CloseReason, Result};
use crate::handshake::{
    HandshakeParams, HandshakeResult, UpgradeOutcome, build_request, client_handshake,
    generate_key,
};
use crate::net::{BoxedStream, Connector, authority, request_target, websocket_location};
use crate::pipeline::{ConnectRequest, Event};
use crate::protocol::{Message, Protocol};
use crate::transport::{Command, EventSink};
use crate::{Config, MAX_FRAME_HEADER_SIZE, RECV_BUFFER_SIZE, SMALL_MESSAGE_THRESHOLD};

/// Drive one native attempt from upgrade to close
pub(super) async fn run(
    config: Arc<Config>,
    connector: Arc<dyn Connector>,
    channel: Arc<Channel>,
    request: ConnectRequest,
    sink: &EventSink,
    commands: mpsc::UnboundedReceiver<Command>,
) -> Result<()> {
    let location = request.location;
    let mut stream = connector.connect(&location).await?;

    let key = generate_key();
    let params = HandshakeParams {
        protocols: request.protocols,
        extensions: request.extensions,
        sequence: channel.next_sequence(),
        authorization: request.authorization,
    };
    debug!(location = %location, sequence = params.sequence, "sending upgrade");
    let upgrade = build_request(&authority(&location)?, &request_target(&location), &key, &params);
    let HandshakeResult { response, leftover } = client_handshake(&mut stream, &upgrade).await?;

    match response.outcome(&key)? {
        UpgradeOutcome::AuthenticationRequired { challenge } => {
            debug!(location = %location, status = response.status, "upgrade challenged");
            sink.emit(Event::AuthenticationRequested {
                location,
                challenge,
            });
            Ok(())
        }
        UpgradeOutcome::Redirect { location: target } => {
            let next = websocket_location(&location, &target)?;
            debug!(location = %location, target = %next, status = response.status, "upgrade redirected");
            sink.emit(Event::Redirected(next));
            Ok(())
        }
        UpgradeOutcome::Accepted {
            protocol,
            extensions,
        } => {
            channel.transition(ReadyState::Open);
            debug!(location = %location, protocol = ?protocol, "native channel open");
            sink.emit(Event::Opened {
                protocol,
                extensions,
            });

            let mut read_buf = BytesMut::with_capacity(RECV_BUFFER_SIZE);
            if let Some(early) = leftover {
                read_buf.extend_from_slice(&early);
            }
            let session = Session {
                stream,
                protocol: Protocol::new(config.max_frame_size, config.max_message_size),
                channel,
                read_buf,
                write_buf: BytesMut::with_capacity(MAX_FRAME_HEADER_SIZE + SMALL_MESSAGE_THRESHOLD),
            };
            session.run(sink, commands).await
        }
    }
}

struct Session {
    stream: BoxedStream,
    protocol: Protocol,
    channel: Arc<Channel>,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl Session {
    async fn run(
        mut self,
        sink: &EventSink,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) -> Result<()> {
        let mut messages = Vec::new();
        let mut commands_open = true;

        loop {
            self.protocol.process_into(&mut self.read_buf, &mut messages)?;
            for message in messages.drain(..) {
                match message {
                    Message::Ping(data) => {
                        trace!(len = data.len(), "answering ping");
                        self.protocol.encode_pong(&data, &mut self.write_buf);
                    }
                    Message::Pong(_) => trace!("pong received"),
                    Message::Close(reason) => return self.finish(reason, sink).await,
                    data => {
                        sink.emit(Event::Message(data));
                    }
                }
            }
            self.flush().await?;
            if self.read_buf.capacity() - self.read_buf.len() < 4096 {
                self.read_buf.reserve(RECV_BUFFER_SIZE);
            }

            tokio::select! {
                read = self.stream.read_buf(&mut self.read_buf) => {
                    if read? == 0 {
                        debug!("native stream ended without close");
                        self.channel.transition(ReadyState::Closed);
                        sink.emit(Event::abnormal_close());
                        return Ok(());
                    }
                }
                command = commands.recv(), if commands_open => match command {
                    Some(Command::Send(message)) => {
                        if let Err(e) = self.protocol.encode_message(&message, &mut self.write_buf) {
                            warn!(error = %e, "dropping message");
                        }
                    }
                    Some(Command::Close(reason)) => {
                        if self.protocol.is_closing() {
                            trace!("close already in progress");
                        } else {
                            self.protocol.encode_close(reason.as_ref(), &mut self.write_buf)?;
                            self.channel.transition(ReadyState::Closing);
                            debug!(code = ?reason.as_ref().map(|r| r.code), "close sent");
                        }
                    }
                    None => commands_open = false,
                },
            }
        }
    }

    /// Complete the close handshake after the peer's close frame
    async fn finish(mut self, reason: Option<CloseReason>, sink: &EventSink) -> Result<()> {
        if self.protocol.needs_close_response() {
            self.protocol.encode_close_response(&mut self.write_buf);
        }
        self.flush().await?;
        if let Err(e) = self.stream.shutdown().await {
            trace!(error = %e, "shutdown after close");
        }

        let (code, reason) = match reason {
            Some(r) => (r.code, r.reason),
            None => (CloseReason::NO_STATUS, String::new()),
        };
        self.channel.transition(ReadyState::Closed);
        debug!(code, "native channel closed");
        sink.emit(Event::Closed {
            code,
            reason,
            was_clean: true,
        });
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if !self.write_buf.is_empty() {
            self.stream.write_all(&self.write_buf).await?;
            self.stream.flush().await?;
            self.write_buf.clear();
        }
        Ok(())
    }
}
