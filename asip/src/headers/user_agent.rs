use core::fmt;

use asip_util::{ArcStr, Scanner};

use super::SipHeaderParse;
use crate::error::Result;

/// The `User-Agent` SIP header.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct UserAgent(ArcStr);

impl UserAgent {
    /// Creates a new `User-Agent` header.
    pub fn new(agent: &str) -> Self {
        Self(agent.into())
    }

    /// Returns the agent string.
    pub fn value(&self) -> &ArcStr {
        &self.0
    }
}

impl fmt::Display for UserAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", UserAgent::NAME, self.0)
    }
}

impl SipHeaderParse for UserAgent {
    const NAME: &'static str = "User-Agent";

    fn parse(scanner: &mut Scanner<'_>) -> Result<Self> {
        scanner.skip_ws();
        let value = scanner.read_until_any(b"\r\n");
        Ok(UserAgent(std::str::from_utf8(value)?.trim().into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let agent = UserAgent::from_bytes(b"asip/0.1.0").unwrap();
        assert_eq!(agent.value(), "asip/0.1.0");
        assert_eq!(agent.to_string(), "User-Agent: asip/0.1.0");
    }
}
