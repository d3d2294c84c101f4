//! # asip
//!
//! An asynchronous SIP (RFC 3261) client/server library: message codec,
//! UDP/TCP/WebSocket transports, the four transaction state machines,
//! a dialog layer with digest authentication and a dialplan-driven
//! endpoint that can act as UAC, UAS or back-to-back user agent.

pub mod auth;
pub mod dialog;
pub mod dialplan;
pub mod endpoint;
pub mod headers;
pub mod message;
pub mod parser;
pub mod peer;
pub mod proxy;
pub mod service;
pub mod transaction;
pub mod transport;

pub(crate) mod error;

pub use asip_util::ArcStr;
pub use dialog::Dialog;
pub use dialplan::{Dialplan, Handler, IncomingCall};
pub use endpoint::Endpoint;
pub use error::{Error, Result, SipParserError};
pub use peer::Peer;
pub use service::SipService;

use rand::Rng;
use std::net::SocketAddr;

/// The magic cookie every RFC 3261 branch starts with.
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// Generates a new Via branch parameter.
pub fn gen_branch() -> ArcStr {
    format!("{}{:016x}", BRANCH_MAGIC_COOKIE, rand::rng().random::<u64>()).into()
}

/// Generates a new From/To tag (16 hex characters).
pub fn gen_tag() -> ArcStr {
    format!("{:016x}", rand::rng().random::<u64>()).into()
}

/// Generates a new Call-ID.
pub fn gen_call_id() -> ArcStr {
    uuid::Uuid::new_v4().to_string().into()
}

/// Derives a UAS To-tag from a Via branch, so every response to one
/// transaction carries the same tag without shared state.
pub(crate) fn tag_from_branch(branch: &str) -> ArcStr {
    match branch.strip_prefix(BRANCH_MAGIC_COOKIE) {
        Some(rest) if !rest.is_empty() => rest.into(),
        _ => branch.into(),
    }
}

pub(crate) fn get_local_name(addr: &SocketAddr) -> String {
    let ip = local_ip_address::local_ip().unwrap_or(addr.ip());

    format!("{}:{}", ip, addr.port())
}

#[cfg(test)]
#[macro_use]
extern crate assert_matches;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gen_branch_has_magic_cookie() {
        let branch = gen_branch();
        assert!(branch.starts_with(BRANCH_MAGIC_COOKIE));
        assert_eq!(branch.len(), BRANCH_MAGIC_COOKIE.len() + 16);
    }

    #[test]
    fn test_gen_tag_is_16_hex_chars() {
        let tag = gen_tag();
        assert_eq!(tag.len(), 16);
        assert!(tag.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
