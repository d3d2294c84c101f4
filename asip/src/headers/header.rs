use std::fmt;

use asip_util::{ArcStr, Scanner};
use enum_as_inner::EnumAsInner;

use super::{
    Authorization, CallId, Contact, ContentLength, ContentType, CSeq, Expires, From,
    MaxForwards, ProxyAuthenticate, ProxyAuthorization, RecordRoute, Route, SipHeaderParse,
    To, UserAgent, Via, WWWAuthenticate,
};
use crate::error::Result;

/// A single SIP header.
///
/// Headers the library works with are fully typed; everything else is
/// carried verbatim in [`Header::Other`].
#[derive(Debug, Clone, PartialEq, EnumAsInner)]
pub enum Header {
    /// The `Via` header.
    Via(Via),
    /// The `From` header.
    From(From),
    /// The `To` header.
    To(To),
    /// The `Contact` header.
    Contact(Contact),
    /// The `Call-ID` header.
    CallId(CallId),
    /// The `CSeq` header.
    CSeq(CSeq),
    /// The `Content-Length` header.
    ContentLength(ContentLength),
    /// The `Content-Type` header.
    ContentType(ContentType),
    /// The `Expires` header.
    Expires(Expires),
    /// The `Max-Forwards` header.
    MaxForwards(MaxForwards),
    /// The `User-Agent` header.
    UserAgent(UserAgent),
    /// The `Authorization` header.
    Authorization(Authorization),
    /// The `Proxy-Authorization` header.
    ProxyAuthorization(ProxyAuthorization),
    /// The `WWW-Authenticate` header.
    WWWAuthenticate(WWWAuthenticate),
    /// The `Proxy-Authenticate` header.
    ProxyAuthenticate(ProxyAuthenticate),
    /// The `Route` header.
    Route(Route),
    /// The `Record-Route` header.
    RecordRoute(RecordRoute),
    /// Any header this library does not interpret.
    Other {
        /// The header name as it appeared on the wire.
        name: ArcStr,
        /// The raw header value.
        value: ArcStr,
    },
}

impl Header {
    /// Creates an [`Header::Other`] from a name and value.
    pub fn other(name: &str, value: &str) -> Self {
        Header::Other {
            name: name.into(),
            value: value.into(),
        }
    }

    /// The header name as emitted on the wire.
    pub fn name(&self) -> &str {
        match self {
            Header::Via(_) => Via::NAME,
            Header::From(_) => From::NAME,
            Header::To(_) => To::NAME,
            Header::Contact(_) => Contact::NAME,
            Header::CallId(_) => CallId::NAME,
            Header::CSeq(_) => CSeq::NAME,
            Header::ContentLength(_) => ContentLength::NAME,
            Header::ContentType(_) => ContentType::NAME,
            Header::Expires(_) => Expires::NAME,
            Header::MaxForwards(_) => MaxForwards::NAME,
            Header::UserAgent(_) => UserAgent::NAME,
            Header::Authorization(_) => Authorization::NAME,
            Header::ProxyAuthorization(_) => ProxyAuthorization::NAME,
            Header::WWWAuthenticate(_) => WWWAuthenticate::NAME,
            Header::ProxyAuthenticate(_) => ProxyAuthenticate::NAME,
            Header::Route(_) => Route::NAME,
            Header::RecordRoute(_) => RecordRoute::NAME,
            Header::Other { name, .. } => name,
        }
    }

    /// Parses one header value given its wire name.
    ///
    /// Unknown names fall back to [`Header::Other`] with the raw value
    /// kept verbatim.
    pub fn parse_value(name: &str, value: &[u8]) -> Result<Header> {
        let scanner = &mut Scanner::new(value);

        macro_rules! dispatch {
            ($($ty:ident),+ $(,)?) => {
                $(
                    if $ty::matches_name(name) {
                        return Ok(Header::$ty($ty::parse(scanner)?));
                    }
                )+
            };
        }

        dispatch!(
            Via,
            From,
            To,
            Contact,
            CallId,
            CSeq,
            ContentLength,
            ContentType,
            Expires,
            MaxForwards,
            UserAgent,
            Authorization,
            ProxyAuthorization,
            WWWAuthenticate,
            ProxyAuthenticate,
            Route,
            RecordRoute,
        );

        Ok(Header::Other {
            name: name.into(),
            value: std::str::from_utf8(value)?.trim().into(),
        })
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Header::Via(h) => write!(f, "{}", h),
            Header::From(h) => write!(f, "{}", h),
            Header::To(h) => write!(f, "{}", h),
            Header::Contact(h) => write!(f, "{}", h),
            Header::CallId(h) => write!(f, "{}", h),
            Header::CSeq(h) => write!(f, "{}", h),
            Header::ContentLength(h) => write!(f, "{}", h),
            Header::ContentType(h) => write!(f, "{}", h),
            Header::Expires(h) => write!(f, "{}", h),
            Header::MaxForwards(h) => write!(f, "{}", h),
            Header::UserAgent(h) => write!(f, "{}", h),
            Header::Authorization(h) => write!(f, "{}", h),
            Header::ProxyAuthorization(h) => write!(f, "{}", h),
            Header::WWWAuthenticate(h) => write!(f, "{}", h),
            Header::ProxyAuthenticate(h) => write!(f, "{}", h),
            Header::Route(h) => write!(f, "{}", h),
            Header::RecordRoute(h) => write!(f, "{}", h),
            Header::Other { name, value } => write!(f, "{}: {}", name, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_by_name() {
        let header = Header::parse_value("v", b"SIP/2.0/UDP host;branch=z9hG4bK1").unwrap();
        assert_matches!(header, Header::Via(_));

        let header = Header::parse_value("CALL-ID", b"abc@example").unwrap();
        assert_matches!(header, Header::CallId(_));

        let header = Header::parse_value("X-Custom", b"anything at all").unwrap();
        assert_matches!(header, Header::Other { .. });
    }

    #[test]
    fn test_other_display() {
        let header = Header::other("Event", "dialog");
        assert_eq!(header.to_string(), "Event: dialog");
    }
}
