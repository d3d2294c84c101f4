use core::fmt;

use asip_util::Scanner;

use super::SipHeaderParse;
use crate::error::Result;

/// The `Expires` SIP header.
///
/// Lifetime in seconds of a registration or subscription. Zero removes
/// the binding.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Expires(u32);

impl Expires {
    /// Creates a new `Expires` header.
    pub const fn new(seconds: u32) -> Self {
        Self(seconds)
    }

    /// Returns the expiry in seconds.
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Expires {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", Expires::NAME, self.0)
    }
}

impl SipHeaderParse for Expires {
    const NAME: &'static str = "Expires";

    fn parse(scanner: &mut Scanner<'_>) -> Result<Self> {
        scanner.skip_ws();
        Ok(Expires(scanner.read_u32()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let expires = Expires::from_bytes(b"7200").unwrap();
        assert_eq!(expires.as_u32(), 7200);
        assert_eq!(expires.to_string(), "Expires: 7200");
    }
}
