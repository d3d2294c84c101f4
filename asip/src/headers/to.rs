use core::fmt;

use asip_util::{ArcStr, Scanner};

use super::{SipHeaderParse, TAG_PARAM};
use crate::error::Result;
use crate::message::{Params, SipAddr, Uri};

/// The `To` SIP header.
///
/// Specifies the logical recipient of the request. The `tag` parameter
/// establishes the remote half of a dialog identity.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct To {
    /// The address of the recipient.
    pub addr: SipAddr,
    tag: Option<ArcStr>,
    params: Params,
}

impl To {
    /// Creates a new `To` header without a tag.
    pub fn new(addr: SipAddr) -> Self {
        Self {
            addr,
            tag: None,
            params: Params::new(),
        }
    }

    /// Returns the URI of the address.
    pub fn uri(&self) -> &Uri {
        self.addr.uri()
    }

    /// Returns the tag parameter.
    pub fn tag(&self) -> Option<&ArcStr> {
        self.tag.as_ref()
    }

    /// Sets the tag parameter.
    pub fn set_tag(&mut self, tag: ArcStr) {
        self.tag = Some(tag);
    }

    /// Generates and sets a tag if one is absent, returning the tag in
    /// effect afterwards.
    pub fn add_tag(&mut self) -> &ArcStr {
        if self.tag.is_none() {
            self.tag = Some(crate::gen_tag());
        }
        self.tag.as_ref().unwrap()
    }
}

impl fmt::Display for To {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", To::NAME, self.addr)?;
        if let Some(tag) = &self.tag {
            write!(f, ";{}={}", TAG_PARAM, tag)?;
        }
        write!(f, "{}", self.params)
    }
}

impl SipHeaderParse for To {
    const NAME: &'static str = "To";
    const SHORT_NAME: Option<&'static str> = Some("t");

    fn parse(scanner: &mut Scanner<'_>) -> Result<Self> {
        let addr = SipAddr::parse(scanner)?;
        let mut params = Params::parse(scanner)?;
        let tag = params.remove(TAG_PARAM);

        Ok(To { addr, tag, params })
    }
}

impl std::convert::From<super::From> for To {
    fn from(from: super::From) -> Self {
        let mut to = To::new(from.addr.clone());
        if let Some(tag) = from.tag() {
            to.set_tag(tag.clone());
        }
        to
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_without_tag() {
        let to = To::from_bytes(b"Bob <sip:bob@biloxi.com>").unwrap();

        assert!(to.tag().is_none());
        assert_eq!(to.uri().user_str(), Some("bob"));
    }

    #[test]
    fn test_roundtrip() {
        let src = "To: <sip:bob@biloxi.com>;tag=a6c85cf";
        let to = To::from_bytes(src.trim_start_matches("To: ").as_bytes()).unwrap();
        assert_eq!(to.to_string(), src);
    }
}
