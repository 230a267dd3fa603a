//! Redirect and balancer handling
//!
//! Follows HTTP redirects reported by the transport and interprets the gateway's in-band
//! balancer messages during the first messages after open. Every redirect aborts the
//! current attempt and issues a new connect below this stage, bounded by
//! `max_redirects`. When the gateway negotiated the internal handshake protocol the
//! `Opened` event is held back until the balancer says to proceed.

use tracing::{debug, warn};
use url::Url;

use super::{ConnectRequest, Event, Output, Request, Stage};
use crate::balancer::{self, BALANCER_WINDOW, BalancerMessage, INTERNAL_PROTOCOL};
use crate::error::Error;

pub struct RedirectStage {
    max_redirects: u32,
    redirects: u32,
    /// Connect as issued from above
    original: Option<ConnectRequest>,
    /// Connect most recently sent below
    current: Option<ConnectRequest>,
    /// Opened forwarded upward for this attempt
    opened: bool,
    /// Extensions of an `Opened` held back for the balancer
    deferred: Option<Option<String>>,
    /// Messages still inspected for balancer codes
    window: usize,
}

impl RedirectStage {
    pub fn new(max_redirects: u32) -> Self {
        Self {
            max_redirects,
            redirects: 0,
            original: None,
            current: None,
            opened: false,
            deferred: None,
            window: 0,
        }
    }

    fn redirect(&mut self, location: Url, balancer: bool, out: &mut Output) {
        self.redirects += 1;
        self.deferred = None;
        self.window = 0;

        if self.redirects > self.max_redirects {
            warn!(location = %location, max = self.max_redirects, "redirect limit reached");
            out.forward_request(Request::Abort);
            out.forward_event(Event::Failed(Error::Redirect(format!(
                "more than {} redirects",
                self.max_redirects
            ))));
            return;
        }

        let (Some(original), Some(current)) = (&self.original, &self.current) else {
            out.forward_event(Event::Failed(Error::InvalidState("redirect without connect")));
            return;
        };

        let protocols = if balancer {
            balancer::with_internal_protocol(&original.protocols)
        } else {
            current.protocols.clone()
        };
        let next = ConnectRequest {
            location: location.clone(),
            protocols,
            extensions: current.extensions.clone(),
            authorization: None,
        };

        debug!(location = %location, balancer, count = self.redirects, "following redirect");
        self.current = Some(next.clone());
        out.forward_request(Request::Abort);
        out.forward_request(Request::Connect(next));
        out.forward_event(Event::Redirected(location));
    }

    fn release_opened(&mut self, out: &mut Output) {
        if let Some(extensions) = self.deferred.take() {
            if !self.opened {
                self.opened = true;
                out.forward_event(Event::Opened {
                    protocol: None,
                    extensions,
                });
            }
        }
    }
}

impl Stage for RedirectStage {
    fn on_request(&mut self, request: Request, out: &mut Output) {
        match request {
            Request::Connect(req) => {
                self.redirects = 0;
                self.opened = false;
                self.deferred = None;
                self.window = 0;
                self.original = Some(req.clone());
                self.current = Some(req.clone());
                out.forward_request(Request::Connect(req));
            }
            other => out.forward_request(other),
        }
    }

    fn on_event(&mut self, event: Event, out: &mut Output) {
        match event {
            Event::Opened {
                protocol,
                extensions,
            } => {
                self.window = BALANCER_WINDOW;
                if protocol.as_deref() == Some(INTERNAL_PROTOCOL) {
                    debug!("awaiting balancer decision");
                    self.deferred = Some(extensions);
                } else if self.opened {
                    // reconnected transparently after a balancer redirect
                    debug!("balanced connection opened");
                } else {
                    self.opened = true;
                    out.forward_event(Event::Opened {
                        protocol,
                        extensions,
                    });
                }
            }
            Event::Message(message) if self.window > 0 => {
                self.window -= 1;
                match balancer::parse(&message) {
                    Ok(Some(BalancerMessage::Proceed)) => {
                        self.window = 0;
                        self.release_opened(out);
                    }
                    Ok(Some(BalancerMessage::Redirect(location))) => {
                        self.redirect(location, true, out);
                    }
                    Ok(None) => {
                        self.release_opened(out);
                        out.forward_event(Event::Message(message));
                    }
                    Err(e) => {
                        out.forward_request(Request::Abort);
                        out.forward_event(Event::Failed(e));
                    }
                }
            }
            Event::Redirected(location) => self.redirect(location, false, out),
            Event::Closed { .. } | Event::Failed(_) => {
                self.deferred = None;
                self.window = 0;
                out.forward_event(event);
            }
            other => out.forward_event(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::BALANCER_PREFIX;
    use crate::pipeline::Pipeline;
    use crate::protocol::Message;

    fn pipeline(max: u32) -> Pipeline {
        let mut pipeline = Pipeline::new(vec![Box::new(RedirectStage::new(max))]);
        let mut req = ConnectRequest::new(Url::parse("ws://gw/echo").unwrap());
        req.protocols = vec!["chat".into()];
        pipeline.request(Request::Connect(req));
        pipeline
    }

    fn opened(protocol: Option<&str>) -> Event {
        Event::Opened {
            protocol: protocol.map(str::to_string),
            extensions: None,
        }
    }

    #[test]
    fn test_balancer_redirect_prepends_internal_protocol() {
        let mut pipeline = pipeline(3);
        pipeline.event(opened(None));

        let msg = Message::text(format!("{BALANCER_PREFIX}Rws://node2/echo"));
        let dispatch = pipeline.event(Event::Message(msg));

        match &dispatch.to_transport[..] {
            [Request::Abort, Request::Connect(req)] => {
                assert_eq!(req.location.as_str(), "ws://node2/echo");
                assert_eq!(req.protocols, vec![INTERNAL_PROTOCOL.to_string(), "chat".into()]);
            }
            other => panic!("unexpected requests {other:?}"),
        }
        assert!(matches!(dispatch.to_facade[..], [Event::Redirected(_)]));
    }

    #[test]
    fn test_opened_deferred_until_proceed() {
        let mut pipeline = pipeline(3);
        let dispatch = pipeline.event(opened(Some(INTERNAL_PROTOCOL)));
        assert!(dispatch.to_facade.is_empty());

        let msg = Message::text(format!("{BALANCER_PREFIX}N"));
        let dispatch = pipeline.event(Event::Message(msg));
        assert!(matches!(
            dispatch.to_facade[..],
            [Event::Opened { protocol: None, .. }]
        ));

        // window closed: later messages pass untouched
        let dispatch = pipeline.event(Event::Message(Message::text("data")));
        assert!(matches!(dispatch.to_facade[..], [Event::Message(_)]));
    }

    #[test]
    fn test_reconnected_open_not_repeated() {
        let mut pipeline = pipeline(3);
        assert_eq!(pipeline.event(opened(None)).to_facade.len(), 1);
        let msg = Message::text(format!("{BALANCER_PREFIX}Rws://node2/echo"));
        pipeline.event(Event::Message(msg));
        assert!(pipeline.event(opened(None)).to_facade.is_empty());
    }

    #[test]
    fn test_http_redirect_and_limit() {
        let mut pipeline = pipeline(1);
        let target = Url::parse("ws://other/echo").unwrap();

        let dispatch = pipeline.event(Event::Redirected(target.clone()));
        match &dispatch.to_transport[..] {
            [Request::Abort, Request::Connect(req)] => {
                assert_eq!(req.location, target);
                assert_eq!(req.protocols, vec!["chat".to_string()]);
            }
            other => panic!("unexpected requests {other:?}"),
        }

        let dispatch = pipeline.event(Event::Redirected(target));
        assert!(matches!(
            dispatch.to_facade[..],
            [Event::Failed(Error::Redirect(_))]
        ));
    }

    #[test]
    fn test_ordinary_first_message_passes() {
        let mut pipeline = pipeline(3);
        pipeline.event(opened(None));
        let dispatch = pipeline.event(Event::Message(Message::text("hello")));
        assert!(matches!(dispatch.to_facade[..], [Event::Message(_)]));
    }
}
