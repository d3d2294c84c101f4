use core::fmt;

use asip_util::{ArcStr, Scanner};

use super::SipHeaderParse;
use crate::error::{Result, SipParserError};

/// The `Call-ID` SIP header.
///
/// Groups all messages of one call, one registration or one subscription
/// together.
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct CallId(ArcStr);

impl CallId {
    /// Creates a new `Call-ID` header.
    pub fn new(id: &str) -> Self {
        Self(id.into())
    }

    /// Returns the id value.
    pub fn value(&self) -> &ArcStr {
        &self.0
    }
}

impl std::convert::From<ArcStr> for CallId {
    fn from(id: ArcStr) -> Self {
        Self(id)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", CallId::NAME, self.0)
    }
}

impl SipHeaderParse for CallId {
    const NAME: &'static str = "Call-ID";
    const SHORT_NAME: Option<&'static str> = Some("i");

    fn parse(scanner: &mut Scanner<'_>) -> Result<Self> {
        scanner.skip_ws();
        let id = scanner.read_until_any(b" \t\r\n");
        if id.is_empty() {
            return Err(SipParserError::new("empty Call-ID").into());
        }

        Ok(CallId(std::str::from_utf8(id)?.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let call_id = CallId::from_bytes(b"843817637684230@998sdasdh09").unwrap();
        assert_eq!(call_id.value(), "843817637684230@998sdasdh09");
    }

    #[test]
    fn test_display() {
        let call_id = CallId::new("f81d4fae-7dec-11d0-a765-00a0c91e6bf6@foo.bar.com");
        assert_eq!(
            call_id.to_string(),
            "Call-ID: f81d4fae-7dec-11d0-a765-00a0c91e6bf6@foo.bar.com"
        );
    }
}
