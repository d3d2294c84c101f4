use core::fmt;

use asip_util::Scanner;

use super::SipHeaderParse;
use crate::error::Result;
use crate::message::auth::Credential;

/// The `Authorization` SIP header.
///
/// Carries the credentials answering a `WWW-Authenticate` challenge.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Authorization(pub Credential);

impl Authorization {
    /// Returns the credential.
    pub fn credential(&self) -> &Credential {
        &self.0
    }
}

impl fmt::Display for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", Authorization::NAME, self.0)
    }
}

impl SipHeaderParse for Authorization {
    const NAME: &'static str = "Authorization";

    fn parse(scanner: &mut Scanner<'_>) -> Result<Self> {
        Ok(Authorization(Credential::parse(scanner)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let auth = Authorization::from_bytes(
            b"Digest username=\"alice\", realm=\"atlanta.com\", nonce=\"N\", response=\"abc\"",
        )
        .unwrap();

        let digest = auth.credential().digest().unwrap();
        assert_eq!(digest.username.as_ref().unwrap(), "alice");
        assert_eq!(digest.response.as_ref().unwrap(), "abc");
    }
}
