use core::fmt;

use asip_util::Scanner;

use super::SipHeaderParse;
use crate::error::Result;
use crate::message::auth::Challenge;

/// The `Proxy-Authenticate` SIP header.
///
/// Challenges the client to authenticate with a proxy on the path.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ProxyAuthenticate(pub Challenge);

impl ProxyAuthenticate {
    /// Returns the challenge.
    pub fn challenge(&self) -> &Challenge {
        &self.0
    }
}

impl fmt::Display for ProxyAuthenticate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", ProxyAuthenticate::NAME, self.0)
    }
}

impl SipHeaderParse for ProxyAuthenticate {
    const NAME: &'static str = "Proxy-Authenticate";

    fn parse(scanner: &mut Scanner<'_>) -> Result<Self> {
        Ok(ProxyAuthenticate(Challenge::parse(scanner)?))
    }
}
