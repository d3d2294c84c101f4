use core::fmt;

use asip_util::Scanner;

use super::SipHeaderParse;
use crate::error::Result;
use crate::message::auth::Challenge;

/// The `WWW-Authenticate` SIP header.
///
/// Challenges the client to authenticate with the UAS.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct WWWAuthenticate(pub Challenge);

impl WWWAuthenticate {
    /// Returns the challenge.
    pub fn challenge(&self) -> &Challenge {
        &self.0
    }
}

impl fmt::Display for WWWAuthenticate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", WWWAuthenticate::NAME, self.0)
    }
}

impl SipHeaderParse for WWWAuthenticate {
    const NAME: &'static str = "WWW-Authenticate";

    fn parse(scanner: &mut Scanner<'_>) -> Result<Self> {
        Ok(WWWAuthenticate(Challenge::parse(scanner)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let www = WWWAuthenticate::from_bytes(
            b"Digest realm=\"atlanta.com\", nonce=\"84a4cc6f\", algorithm=MD5",
        )
        .unwrap();

        let digest = www.challenge().digest().unwrap();
        assert_eq!(digest.realm.as_ref().unwrap(), "atlanta.com");
    }
}
