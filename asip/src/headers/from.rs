use core::fmt;

use asip_util::{ArcStr, Scanner};

use super::{SipHeaderParse, TAG_PARAM};
use crate::error::Result;
use crate::message::{Params, SipAddr, Uri};

/// The `From` SIP header.
///
/// Indicates the initiator of the request. The `tag` parameter
/// establishes the local half of a dialog identity.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct From {
    /// The address of the initiator.
    pub addr: SipAddr,
    tag: Option<ArcStr>,
    params: Params,
}

impl From {
    /// Creates a new `From` header without a tag.
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

impl fmt::Display for From {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", From::NAME, self.addr)?;
        if let Some(tag) = &self.tag {
            write!(f, ";{}={}", TAG_PARAM, tag)?;
        }
        write!(f, "{}", self.params)
    }
}

impl SipHeaderParse for From {
    const NAME: &'static str = "From";
    const SHORT_NAME: Option<&'static str> = Some("f");

    fn parse(scanner: &mut Scanner<'_>) -> Result<Self> {
        let addr = SipAddr::parse(scanner)?;
        let mut params = Params::parse(scanner)?;
        let tag = params.remove(TAG_PARAM);

        Ok(From { addr, tag, params })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_tag() {
        let from = From::from_bytes(b"Bob <sip:bob@biloxi.com>;tag=456248").unwrap();

        assert_eq!(from.addr.display(), Some("Bob"));
        assert_eq!(from.tag().unwrap(), "456248");
        assert_eq!(from.uri().user_str(), Some("bob"));
    }

    #[test]
    fn test_add_tag_is_stable() {
        let mut from = From::from_bytes(b"sip:alice@atlanta.com").unwrap();
        assert!(from.tag().is_none());

        let tag = from.add_tag().clone();
        assert_eq!(from.add_tag(), &tag);
    }

    #[test]
    fn test_display() {
        let mut from = From::from_bytes(b"<sip:alice@atlanta.com>").unwrap();
        from.set_tag("1928301774".into());
        assert_eq!(from.to_string(), "From: <sip:alice@atlanta.com>;tag=1928301774");
    }
}
