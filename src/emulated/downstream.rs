//! Downstream channel: server-to-client frames over long-lived POST responses
//!
//! One task owns the downstream request loop and its idle timer. Each response body is
//! decoded as it streams in. When a response completes without a close command the
//! downstream re-POSTs to the same location, unless the client is closing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace, warn};
use url::Url;

use super::codec::{ControlCommand, EmulatedDecoder, EmulatedFrame};
use super::http::{HttpClient, HttpRequest, HttpResponse};
use super::upstream::Upstream;
use super::{ChannelSignal, SessionContext};
use crate::Config;
use crate::channel::Channel;
use crate::error::{CloseReason, Error, Result};
use crate::frame::decode_close_payload;
use crate::handshake::headers::{X_IDLE_TIMEOUT, X_SEQUENCE};
use crate::net::is_secure;
use crate::protocol::Message;
use crate::utf8::validate_utf8;

/// Query pair marking a request that must survive a buffering proxy
pub const PROXY_MODE_QUERY: (&str, &str) = (".ki", "p");

/// How one downstream response ended
enum Completion {
    /// Body ended without a close command
    Ended,
    /// Server sent the close command and payload
    Closed(Option<CloseReason>),
}

pub(super) struct Downstream {
    pub(super) http: Arc<dyn HttpClient>,
    pub(super) config: Arc<Config>,
    pub(super) context: Arc<SessionContext>,
    pub(super) channel: Arc<Channel>,
    pub(super) upstream: Upstream,
    pub(super) closing: Arc<AtomicBool>,
    pub(super) signals: mpsc::UnboundedSender<ChannelSignal>,
}

impl Downstream {
    /// Run the request loop until the channel closes or fails
    pub(super) async fn run(self) {
        let signal = match self.receive().await {
            Ok(Some(reason)) => ChannelSignal::Close(reason),
            Ok(None) => ChannelSignal::Ended,
            Err(e) => ChannelSignal::Failed(e),
        };
        let _ = self.signals.send(signal);
    }

    /// Returns `Some(reason)` when the server closed, `None` when the downstream ended
    /// while the client was closing
    ///
    /// The idle timeout is fixed by the first response and also bounds the wait for the
    /// head of every later response.
    async fn receive(&self) -> Result<Option<Option<CloseReason>>> {
        let mut proxy_mode = false;
        let mut idle: Option<Option<Duration>> = None;

        loop {
            let location = self.location(proxy_mode);
            let sequence = self.channel.next_sequence();
            debug!(location = %location, sequence, proxy_mode, "downstream POST");
            let request = self
                .context
                .decorate(HttpRequest::post(location).header(X_SEQUENCE, sequence.to_string()));

            let response = match idle {
                Some(Some(limit)) => match timeout(limit, self.http.execute(request)).await {
                    Ok(response) => response?,
                    Err(_) => {
                        warn!(timeout = ?limit, "no response to downstream reconnect");
                        return Err(Error::IdleTimeout(limit));
                    }
                },
                Some(None) => self.http.execute(request).await?,
                None if !proxy_mode && !is_secure(&self.channel.location()) => {
                    match timeout(self.config.proxy_fallback_delay, self.http.execute(request)).await
                    {
                        Ok(response) => response?,
                        Err(_) => {
                            warn!(
                                delay = ?self.config.proxy_fallback_delay,
                                "no downstream response, retrying in proxy mode"
                            );
                            proxy_mode = true;
                            continue;
                        }
                    }
                }
                None => self.http.execute(request).await?,
            };

            if !response.is_success() {
                return Err(Error::HttpStatus(response.status));
            }
            let limit = match idle {
                Some(limit) => limit,
                None => {
                    let limit = self.idle_timeout(&response);
                    debug!(timeout = ?limit, "downstream open");
                    idle = Some(limit);
                    let _ = self.signals.send(ChannelSignal::Opened);
                    limit
                }
            };

            match self.read_response(response, limit).await? {
                Completion::Closed(reason) => return Ok(Some(reason)),
                Completion::Ended if self.closing.load(Ordering::Acquire) => {
                    debug!("downstream ended while closing");
                    return Ok(None);
                }
                Completion::Ended => debug!("downstream response complete, reconnecting"),
            }
        }
    }

    fn location(&self, proxy_mode: bool) -> Url {
        let mut location = self.channel.location();
        if proxy_mode {
            location
                .query_pairs_mut()
                .append_pair(PROXY_MODE_QUERY.0, PROXY_MODE_QUERY.1);
        }
        location
    }

    fn idle_timeout(&self, response: &HttpResponse) -> Option<Duration> {
        response
            .header(X_IDLE_TIMEOUT)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
            .or(self.config.default_idle_timeout)
    }

    async fn read_response(
        &self,
        mut response: HttpResponse,
        idle: Option<Duration>,
    ) -> Result<Completion> {
        let mut decoder = EmulatedDecoder::new(self.config.max_frame_size);
        let mut close_pending = false;
        let mut reconnect = false;

        loop {
            let chunk = match idle {
                Some(idle) => match timeout(idle, response.body.next()).await {
                    Ok(chunk) => chunk,
                    Err(_) => {
                        warn!(timeout = ?idle, "downstream idle timeout");
                        return Err(Error::IdleTimeout(idle));
                    }
                },
                None => response.body.next().await,
            };
            let Some(chunk) = chunk else {
                if reconnect {
                    trace!("server requested reconnect");
                }
                return Ok(Completion::Ended);
            };

            decoder.feed(&chunk?);
            while let Some(frame) = decoder.decode()? {
                match frame {
                    EmulatedFrame::Command(ControlCommand::Noop) => trace!("no-op command"),
                    EmulatedFrame::Command(ControlCommand::Reconnect) => reconnect = true,
                    EmulatedFrame::Command(ControlCommand::Close) => close_pending = true,
                    EmulatedFrame::Command(ControlCommand::Unknown(code)) => {
                        debug!(code = ?code, "ignoring unknown command")
                    }
                    EmulatedFrame::Binary(payload) if close_pending => {
                        return self.close_payload(payload).map(Completion::Closed);
                    }
                    EmulatedFrame::Binary(payload) => self.deliver(Message::Binary(payload))?,
                    EmulatedFrame::Text(payload) => {
                        if !validate_utf8(&payload) {
                            return Err(Error::InvalidUtf8);
                        }
                        self.deliver(Message::Text(payload))?;
                    }
                    EmulatedFrame::Ping => {
                        trace!("answering emulated ping");
                        self.upstream.send(&Message::Pong(Bytes::new()));
                    }
                    EmulatedFrame::Pong => trace!("emulated pong"),
                }
            }
        }
    }

    fn close_payload(&self, payload: Bytes) -> Result<Option<CloseReason>> {
        match payload.len() {
            0 => Ok(None),
            1 => Err(Error::Protocol("invalid close frame payload")),
            _ => {
                if !validate_utf8(&payload[2..]) {
                    return Err(Error::InvalidUtf8);
                }
                Ok(decode_close_payload(&payload))
            }
        }
    }

    fn deliver(&self, message: Message) -> Result<()> {
        if message.as_bytes().len() > self.config.max_message_size {
            return Err(Error::MessageTooLarge);
        }
        self.signals
            .send(ChannelSignal::Message(message))
            .map_err(|_| Error::ConnectionClosed)
    }
}
