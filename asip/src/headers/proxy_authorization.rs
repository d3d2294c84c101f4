use core::fmt;

use asip_util::Scanner;

use super::SipHeaderParse;
use crate::error::Result;
use crate::message::auth::Credential;

/// The `Proxy-Authorization` SIP header.
///
/// Carries the credentials answering a `Proxy-Authenticate` challenge.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ProxyAuthorization(pub Credential);

impl ProxyAuthorization {
    /// Returns the credential.
    pub fn credential(&self) -> &Credential {
        &self.0
    }
}

impl fmt::Display for ProxyAuthorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", ProxyAuthorization::NAME, self.0)
    }
}

impl SipHeaderParse for ProxyAuthorization {
    const NAME: &'static str = "Proxy-Authorization";

    fn parse(scanner: &mut Scanner<'_>) -> Result<Self> {
        Ok(ProxyAuthorization(Credential::parse(scanner)?))
    }
}
