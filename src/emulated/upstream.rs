//! Upstream channel: client-to-server messages as POST bodies
//!
//! Outgoing frames are appended to a shared queue. At most one POST is in flight; it
//! carries everything queued when it started plus a trailing reconnect command. Frames
//! queued while it is in flight go out in the next POST, so order is preserved across
//! POSTs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use super::codec::{self, ControlCommand};
use super::http::{HttpClient, HttpRequest};
use super::{ChannelSignal, SessionContext};
use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::handshake::headers::X_SEQUENCE;
use crate::protocol::Message;

/// Handle to the upstream channel; clones share one queue
#[derive(Clone)]
pub struct Upstream {
    inner: Arc<Inner>,
}

struct Inner {
    http: Arc<dyn HttpClient>,
    context: Arc<SessionContext>,
    channel: Arc<Channel>,
    queue: Mutex<BytesMut>,
    in_flight: AtomicBool,
    signals: mpsc::UnboundedSender<ChannelSignal>,
    token: CancellationToken,
}

impl Upstream {
    pub(super) fn new(
        http: Arc<dyn HttpClient>,
        context: Arc<SessionContext>,
        channel: Arc<Channel>,
        signals: mpsc::UnboundedSender<ChannelSignal>,
        token: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                http,
                context,
                channel,
                queue: Mutex::new(BytesMut::new()),
                in_flight: AtomicBool::new(false),
                signals,
                token,
            }),
        }
    }

    /// Queue a message and make sure a POST will carry it
    pub fn send(&self, message: &Message) {
        {
            let mut queue = self.inner.queue.lock();
            codec::encode_message(&mut queue, message);
        }
        self.flush();
    }

    fn flush(&self) {
        if self
            .inner
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!("upstream POST in flight, message queued");
            return;
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.token.cancelled() => trace!("upstream stopped"),
                result = inner.drain() => {
                    if let Err(e) = result {
                        warn!(error = %e, "upstream failed");
                        let _ = inner.signals.send(ChannelSignal::Failed(e));
                    }
                }
            }
        });
    }
}

impl Inner {
    /// Take the whole queue, or release the in-flight flag if nothing is left
    fn next_body(&self) -> Option<Bytes> {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            self.in_flight.store(false, Ordering::Release);
            return None;
        }
        let mut body = queue.split();
        codec::encode_command(&mut body, &ControlCommand::Reconnect);
        Some(body.freeze())
    }

    async fn drain(&self) -> Result<()> {
        while let Some(body) = self.next_body() {
            let sequence = self.channel.next_sequence();
            debug!(sequence, len = body.len(), "upstream POST");
            let request = self.context.decorate(
                HttpRequest::post(self.location())
                    .header(X_SEQUENCE, sequence.to_string())
                    .header("Content-Type", "application/octet-stream")
                    .body(body),
            );

            let mut response = match self.http.execute(request).await {
                Ok(response) => response,
                Err(e) => {
                    self.in_flight.store(false, Ordering::Release);
                    return Err(e);
                }
            };
            if !response.is_success() {
                self.in_flight.store(false, Ordering::Release);
                return Err(Error::HttpStatus(response.status));
            }
            while let Some(chunk) = response.body.next().await {
                chunk?;
            }
        }
        Ok(())
    }

    fn location(&self) -> Url {
        self.channel.location()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKind;
    use crate::emulated::http::testing::{ChannelHttpClient, response};

    fn upstream() -> (
        Upstream,
        mpsc::UnboundedReceiver<(HttpRequest, crate::emulated::http::testing::Reply)>,
        mpsc::UnboundedReceiver<ChannelSignal>,
    ) {
        let (http, requests) = ChannelHttpClient::new();
        let (signals_tx, signals) = mpsc::unbounded_channel();
        let location = Url::parse("http://gw.example.com/up/1").unwrap();
        let channel = Channel::new(ChannelKind::Upstream, location);
        let context = Arc::new(SessionContext::new(Some("sid=1".into())));
        let upstream = Upstream::new(http, context, channel, signals_tx, CancellationToken::new());
        (upstream, requests, signals)
    }

    fn frames(messages: &[Message]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for m in messages {
            codec::encode_message(&mut buf, m);
        }
        codec::encode_command(&mut buf, &ControlCommand::Reconnect);
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_messages_queued_during_post_share_next_body() {
        let (upstream, mut requests, _signals) = upstream();

        upstream.send(&Message::text("M0"));
        let (first, reply) = requests.recv().await.unwrap();
        assert_eq!(&first.body[..], &frames(&[Message::text("M0")])[..]);
        assert_eq!(first.header_value("Cookie"), Some("sid=1"));
        assert_eq!(first.header_value("X-Sequence"), Some("0"));

        // POST blocked: these wait in the queue
        upstream.send(&Message::text("M1"));
        upstream.send(&Message::text("M2"));
        upstream.send(&Message::text("M3"));
        tokio::task::yield_now().await;
        assert!(requests.try_recv().is_err());

        reply.send(Ok(response(200, &[], b""))).unwrap();
        let (second, reply) = requests.recv().await.unwrap();
        assert_eq!(
            &second.body[..],
            &frames(&[Message::text("M1"), Message::text("M2"), Message::text("M3")])[..]
        );
        assert_eq!(second.header_value("X-Sequence"), Some("1"));
        reply.send(Ok(response(200, &[], b""))).unwrap();

        // queue drained, the next send starts a fresh POST
        tokio::task::yield_now().await;
        upstream.send(&Message::binary(vec![1u8]));
        let (third, _reply) = requests.recv().await.unwrap();
        assert_eq!(&third.body[..], &frames(&[Message::binary(vec![1u8])])[..]);
    }

    #[tokio::test]
    async fn test_error_status_fails_channel() {
        let (upstream, mut requests, mut signals) = upstream();
        upstream.send(&Message::text("x"));
        let (_, reply) = requests.recv().await.unwrap();
        reply.send(Ok(response(500, &[], b""))).unwrap();

        match signals.recv().await.unwrap() {
            ChannelSignal::Failed(Error::HttpStatus(500)) => {}
            other => panic!("unexpected signal {other:?}"),
        }
    }
}
