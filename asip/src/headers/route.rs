use core::fmt;

use asip_util::Scanner;

use super::SipHeaderParse;
use crate::error::Result;
use crate::message::{Params, SipAddr};

/// The `Route` SIP header.
///
/// Forces the request through the listed proxies.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Route {
    /// The route hop address.
    pub addr: SipAddr,
    /// Header parameters outside the angle brackets.
    pub params: Params,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}{}", Route::NAME, self.addr, self.params)
    }
}

impl SipHeaderParse for Route {
    const NAME: &'static str = "Route";

    fn parse(scanner: &mut Scanner<'_>) -> Result<Self> {
        let addr = SipAddr::parse(scanner)?;
        let params = Params::parse(scanner)?;

        Ok(Route { addr, params })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lr() {
        let route = Route::from_bytes(b"<sip:proxy.example.com;lr>").unwrap();
        assert!(route.addr.uri().params.contains("lr"));
    }
}
