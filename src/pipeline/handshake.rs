//! Protocol and extension negotiation
//!
//! Serializes the enabled extensions into every connect and checks the server's answer:
//! the negotiated sub-protocol must be one the caller asked for, and the negotiated
//! extensions must pass [`ExtensionRegistry::negotiate`]. Either violation aborts the
//! attempt with a failure.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{Event, Output, Request, Stage};
use crate::error::Error;
use crate::extension::{EnabledExtension, ExtensionRegistry};

pub struct HandshakeStage {
    registry: Arc<ExtensionRegistry>,
    enabled: Vec<EnabledExtension>,
    requested: Vec<String>,
}

impl HandshakeStage {
    pub fn new(registry: Arc<ExtensionRegistry>, enabled: Vec<EnabledExtension>) -> Self {
        Self {
            registry,
            enabled,
            requested: Vec::new(),
        }
    }

    fn fail(&self, error: Error, out: &mut Output) {
        warn!(error = %error, "handshake rejected");
        out.forward_request(Request::Abort);
        out.forward_event(Event::Failed(error));
    }
}

impl Stage for HandshakeStage {
    fn on_request(&mut self, request: Request, out: &mut Output) {
        match request {
            Request::Connect(mut req) => {
                self.requested = req.protocols.clone();
                match self.registry.serialize(&self.enabled) {
                    Ok(extensions) => {
                        req.extensions = extensions;
                        out.forward_request(Request::Connect(req));
                    }
                    Err(e) => out.forward_event(Event::Failed(e)),
                }
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
                if let Some(p) = &protocol {
                    if !self.requested.iter().any(|r| r == p) {
                        self.fail(
                            Error::HandshakeFailed(format!("server selected unrequested protocol {p}")),
                            out,
                        );
                        return;
                    }
                }
                if let Err(e) = self.registry.negotiate(&self.enabled, extensions.as_deref()) {
                    self.fail(e, out);
                    return;
                }
                debug!(protocol = ?protocol, extensions = ?extensions, "handshake negotiated");
                out.forward_event(Event::Opened {
                    protocol,
                    extensions,
                });
            }
            other => out.forward_event(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::{ExtensionDescriptor, ParameterType};
    use crate::pipeline::{ConnectRequest, Pipeline};
    use url::Url;

    fn pipeline() -> Pipeline {
        let mut registry = ExtensionRegistry::new();
        registry.register(
            ExtensionDescriptor::new("x-gateway-ping").parameter("token", ParameterType::String),
        );
        let enabled = vec![EnabledExtension::new("x-gateway-ping").with("token", "t")];
        Pipeline::new(vec![Box::new(HandshakeStage::new(Arc::new(registry), enabled))])
    }

    fn connect(pipeline: &mut Pipeline) -> ConnectRequest {
        let mut req = ConnectRequest::new(Url::parse("ws://gw/").unwrap());
        req.protocols = vec!["chat".into()];
        let dispatch = pipeline.request(Request::Connect(req));
        match dispatch.to_transport.into_iter().next() {
            Some(Request::Connect(req)) => req,
            other => panic!("expected connect, got {other:?}"),
        }
    }

    #[test]
    fn test_connect_carries_extensions() {
        let mut pipeline = pipeline();
        let req = connect(&mut pipeline);
        assert_eq!(req.extensions.as_deref(), Some("x-gateway-ping; token=t"));
    }

    #[test]
    fn test_accepts_valid_negotiation() {
        let mut pipeline = pipeline();
        connect(&mut pipeline);
        let dispatch = pipeline.event(Event::Opened {
            protocol: Some("chat".into()),
            extensions: Some("x-gateway-ping; token=abc".into()),
        });
        assert!(matches!(dispatch.to_facade[..], [Event::Opened { .. }]));
        assert!(dispatch.to_transport.is_empty());
    }

    #[test]
    fn test_rejects_unrequested_protocol() {
        let mut pipeline = pipeline();
        connect(&mut pipeline);
        let dispatch = pipeline.event(Event::Opened {
            protocol: Some("other".into()),
            extensions: None,
        });
        assert!(matches!(dispatch.to_transport[..], [Request::Abort]));
        assert!(matches!(
            dispatch.to_facade[..],
            [Event::Failed(Error::HandshakeFailed(_))]
        ));
    }

    #[test]
    fn test_rejects_unenabled_extension() {
        let mut pipeline = pipeline();
        connect(&mut pipeline);
        let dispatch = pipeline.event(Event::Opened {
            protocol: None,
            extensions: Some("permessage-deflate".into()),
        });
        assert!(matches!(
            dispatch.to_facade[..],
            [Event::Failed(Error::ExtensionNegotiation(_))]
        ));
    }
}
