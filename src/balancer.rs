//! In-band balancer control messages
//!
//! Right after a native upgrade the gateway may send one or two control messages whose
//! text starts with U+F0FF. `N` means the connection may proceed; `R` is followed by the
//! URI of the node the client should reconnect to.

use url::Url;

use crate::error::{Error, Result};
use crate::protocol::Message;

/// Leading character of every balancer message
pub const BALANCER_PREFIX: char = '\u{F0FF}';

/// Sub-protocol announcing that the gateway may balance this connection
///
/// Prepended to the caller's protocols when reconnecting after a balancer redirect.
pub const INTERNAL_PROTOCOL: &str = "x-gateway-handshake";

/// How many messages after open are inspected for balancer codes
pub const BALANCER_WINDOW: usize = 2;

/// A decoded balancer message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalancerMessage {
    /// Proceed on this connection
    Proceed,
    /// Reconnect to another node
    Redirect(Url),
}

/// Decode a balancer message
///
/// Returns `Ok(None)` for ordinary messages. A prefixed message with an unknown code or
/// an unparseable redirect target is an error.
pub fn parse(message: &Message) -> Result<Option<BalancerMessage>> {
    let payload = match message {
        Message::Text(b) | Message::Binary(b) => b,
        _ => return Ok(None),
    };

    let mut scratch = [0u8; 4];
    let prefix = BALANCER_PREFIX.encode_utf8(&mut scratch).as_bytes();
    let Some(rest) = payload.strip_prefix(prefix) else {
        return Ok(None);
    };

    match rest.split_first() {
        Some((b'N', _)) => Ok(Some(BalancerMessage::Proceed)),
        Some((b'R', target)) => {
            let target = std::str::from_utf8(target)
                .map_err(|_| Error::Redirect("balancer target is not UTF-8".into()))?;
            let url = Url::parse(target.trim())?;
            Ok(Some(BalancerMessage::Redirect(url)))
        }
        _ => Err(Error::Protocol("unknown balancer code")),
    }
}

/// Caller protocols with the internal negotiation protocol first
pub fn with_internal_protocol(protocols: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(protocols.len() + 1);
    out.push(INTERNAL_PROTOCOL.to_string());
    out.extend(protocols.iter().filter(|p| *p != INTERNAL_PROTOCOL).cloned());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proceed() {
        let msg = Message::text(format!("{BALANCER_PREFIX}N"));
        assert_eq!(parse(&msg).unwrap(), Some(BalancerMessage::Proceed));
    }

    #[test]
    fn test_parse_redirect() {
        let msg = Message::binary(format!("{BALANCER_PREFIX}Rws://node2.example.com:8001/echo").into_bytes());
        assert_eq!(
            parse(&msg).unwrap(),
            Some(BalancerMessage::Redirect(
                Url::parse("ws://node2.example.com:8001/echo").unwrap()
            ))
        );
    }

    #[test]
    fn test_ordinary_and_bad_messages() {
        assert_eq!(parse(&Message::text("hello")).unwrap(), None);
        assert_eq!(parse(&Message::Ping(bytes::Bytes::new())).unwrap(), None);
        assert!(parse(&Message::text(format!("{BALANCER_PREFIX}X"))).is_err());
        assert!(parse(&Message::text(format!("{BALANCER_PREFIX}Rnot a url"))).is_err());
    }

    #[test]
    fn test_internal_protocol_prepended_once() {
        let protocols = vec!["chat".to_string(), INTERNAL_PROTOCOL.to_string()];
        assert_eq!(
            with_internal_protocol(&protocols),
            vec![INTERNAL_PROTOCOL.to_string(), "chat".to_string()]
        );
        assert_eq!(with_internal_protocol(&[]), vec![INTERNAL_PROTOCOL.to_string()]);
    }
}
