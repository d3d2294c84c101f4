use core::fmt;

use asip_util::{ArcStr, Scanner};

use super::SipHeaderParse;
use crate::error::Result;

/// The `Content-Type` SIP header.
///
/// The media type of the body; the body itself is opaque to this
/// library.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ContentType(ArcStr);

impl ContentType {
    /// Creates a new `Content-Type` header.
    pub fn new(media_type: &str) -> Self {
        Self(media_type.into())
    }

    /// Returns the media type value.
    pub fn value(&self) -> &ArcStr {
        &self.0
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", ContentType::NAME, self.0)
    }
}

impl SipHeaderParse for ContentType {
    const NAME: &'static str = "Content-Type";
    const SHORT_NAME: Option<&'static str> = Some("c");

    fn parse(scanner: &mut Scanner<'_>) -> Result<Self> {
        scanner.skip_ws();
        let value = scanner.read_until_any(b"\r\n");
        Ok(ContentType(std::str::from_utf8(value)?.trim().into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let ctype = ContentType::from_bytes(b"application/sdp").unwrap();
        assert_eq!(ctype.value(), "application/sdp");
        assert_eq!(ctype.to_string(), "Content-Type: application/sdp");
    }
}
