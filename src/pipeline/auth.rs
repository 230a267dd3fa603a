//! Challenge/response authentication
//!
//! When the transport reports a 401, the stage asks its [`ChallengeHandler`] for a
//! credential and reconnects with it, at most `max_attempts` times per connect. Stored
//! credentials are single-use: they are cleared whenever the attempt opens, is
//! redirected or ends.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use tracing::{debug, warn};
use url::Url;

use super::{ConnectRequest, Event, Output, Request, Stage};
use crate::error::Error;

/// Produces credentials for authentication challenges
pub trait ChallengeHandler: Send + Sync + 'static {
    /// Return an `Authorization` header value for `challenge`, or `None` to give up
    fn respond(&self, location: &Url, challenge: &str) -> Option<String>;
}

/// RFC 7617 Basic credentials
#[derive(Clone)]
pub struct BasicChallengeHandler {
    username: String,
    password: String,
}

impl BasicChallengeHandler {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for BasicChallengeHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicChallengeHandler")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl ChallengeHandler for BasicChallengeHandler {
    fn respond(&self, _location: &Url, challenge: &str) -> Option<String> {
        let scheme = challenge.split_whitespace().next()?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.username, self.password));
        Some(format!("Basic {token}"))
    }
}

pub struct AuthenticationStage {
    handler: Option<Arc<dyn ChallengeHandler>>,
    max_attempts: u32,
    attempts: u32,
    /// Credential supplied through `Authorize`, used by the next connect
    credential: Option<String>,
    last: Option<ConnectRequest>,
}

impl AuthenticationStage {
    pub fn new(handler: Option<Arc<dyn ChallengeHandler>>, max_attempts: u32) -> Self {
        Self {
            handler,
            max_attempts,
            attempts: 0,
            credential: None,
            last: None,
        }
    }

    fn clear(&mut self) {
        self.credential = None;
        if let Some(last) = &mut self.last {
            last.authorization = None;
        }
    }

    fn challenge(&mut self, location: Url, challenge: String, out: &mut Output) {
        self.attempts += 1;
        if self.attempts > self.max_attempts {
            warn!(location = %location, attempts = self.attempts - 1, "authentication attempts exhausted");
            out.forward_event(Event::Failed(Error::AuthenticationFailed(format!(
                "rejected after {} attempts",
                self.max_attempts
            ))));
            return;
        }

        let response = self
            .handler
            .as_ref()
            .and_then(|h| h.respond(&location, &challenge));

        match (response, self.last.clone()) {
            (Some(credential), Some(mut next)) => {
                debug!(location = %location, attempt = self.attempts, "answering challenge");
                next.authorization = Some(credential);
                out.forward_request(Request::Connect(next));
            }
            _ => {
                debug!(location = %location, challenge = %challenge, "no credential for challenge");
                out.forward_event(Event::AuthenticationRequested {
                    location,
                    challenge: challenge.clone(),
                });
                out.forward_event(Event::Failed(Error::AuthenticationFailed(format!(
                    "no credential for challenge {challenge:?}"
                ))));
            }
        }
    }
}

impl Stage for AuthenticationStage {
    fn on_request(&mut self, request: Request, out: &mut Output) {
        match request {
            Request::Connect(mut req) => {
                self.attempts = 0;
                if req.authorization.is_none() {
                    req.authorization = self.credential.clone();
                }
                self.last = Some(req.clone());
                out.forward_request(Request::Connect(req));
            }
            Request::Authorize(token) => {
                self.credential = token;
            }
            other => out.forward_request(other),
        }
    }

    fn on_event(&mut self, event: Event, out: &mut Output) {
        match event {
            Event::AuthenticationRequested {
                location,
                challenge,
            } => self.challenge(location, challenge, out),
            Event::Opened { .. } | Event::Redirected(_) | Event::Closed { .. } | Event::Failed(_) => {
                self.clear();
                out.forward_event(event);
            }
            other => out.forward_event(other),
        }
    }
}
