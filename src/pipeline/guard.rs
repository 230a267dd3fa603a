//! Terminal event guard
//!
//! Topmost stage. Each connect starts a new attempt; within an attempt the facade sees at
//! most one `Opened` and exactly one terminal event, and nothing after it.

use tracing::trace;

use super::{Event, Output, Request, Stage};
use crate::error::Error;

#[derive(Debug, Default)]
pub struct TerminalGuard {
    active: bool,
    opened: bool,
    terminated: bool,
}

impl TerminalGuard {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Stage for TerminalGuard {
    fn on_request(&mut self, request: Request, out: &mut Output) {
        match request {
            Request::Connect(req) => {
                self.active = true;
                self.opened = false;
                self.terminated = false;
                out.forward_request(Request::Connect(req));
            }
            Request::Send(_) if !self.opened || self.terminated => {
                trace!("dropping send outside an open attempt");
            }
            other => out.forward_request(other),
        }
    }

    fn on_event(&mut self, event: Event, out: &mut Output) {
        if !self.active || self.terminated {
            trace!(event = %event, "dropping event after terminal event");
            return;
        }

        match event {
            Event::Opened { .. } if self.opened => {
                trace!("dropping duplicate opened");
            }
            Event::Opened { .. } => {
                self.opened = true;
                out.forward_event(event);
            }
            Event::Closed { .. } if !self.opened => {
                // a close before open is a failed connect
                self.terminated = true;
                out.forward_event(Event::Failed(Error::ConnectionClosed));
            }
            Event::Closed { .. } | Event::Failed(_) => {
                self.terminated = true;
                out.forward_event(event);
            }
            Event::Message(_) if !self.opened => {
                trace!("dropping message before opened");
            }
            other => out.forward_event(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ConnectRequest, Pipeline};
    use crate::protocol::Message;
    use url::Url;

    fn pipeline() -> Pipeline {
        let mut pipeline = Pipeline::new(vec![Box::new(TerminalGuard::new())]);
        let url = Url::parse("ws://gw/").unwrap();
        pipeline.request(Request::Connect(ConnectRequest::new(url)));
        pipeline
    }

    fn opened() -> Event {
        Event::Opened {
            protocol: None,
            extensions: None,
        }
    }

    #[test]
    fn test_nothing_after_terminal() {
        let mut pipeline = pipeline();
        assert_eq!(pipeline.event(opened()).to_facade.len(), 1);
        assert_eq!(pipeline.event(Event::abnormal_close()).to_facade.len(), 1);
        assert!(pipeline.event(Event::abnormal_close()).to_facade.is_empty());
        assert!(
            pipeline
                .event(Event::Message(Message::text("late")))
                .to_facade
                .is_empty()
        );
    }

    #[test]
    fn test_single_opened() {
        let mut pipeline = pipeline();
        assert_eq!(pipeline.event(opened()).to_facade.len(), 1);
        assert!(pipeline.event(opened()).to_facade.is_empty());
    }

    #[test]
    fn test_close_before_open_is_failure() {
        let mut pipeline = pipeline();
        let dispatch = pipeline.event(Event::abnormal_close());
        assert!(matches!(
            dispatch.to_facade[..],
            [Event::Failed(Error::ConnectionClosed)]
        ));
    }

    #[test]
    fn test_new_connect_resets() {
        let mut pipeline = pipeline();
        pipeline.event(Event::Failed(Error::ConnectionClosed));
        let url = Url::parse("ws://gw/").unwrap();
        pipeline.request(Request::Connect(ConnectRequest::new(url)));
        assert_eq!(pipeline.event(opened()).to_facade.len(), 1);
    }

    #[test]
    fn test_send_requires_open() {
        let mut pipeline = pipeline();
        let dispatch = pipeline.request(Request::Send(Message::text("early")));
        assert!(dispatch.to_transport.is_empty());
        pipeline.event(opened());
        let dispatch = pipeline.request(Request::Send(Message::text("ok")));
        assert_eq!(dispatch.to_transport.len(), 1);
    }
}
