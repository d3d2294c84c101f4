use core::fmt;

use asip_util::Scanner;

use super::SipHeaderParse;
use crate::error::Result;
use crate::message::{Params, SipAddr};

/// The `Record-Route` SIP header.
///
/// Inserted by proxies that want to stay on the path of subsequent
/// in-dialog requests.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct RecordRoute {
    /// The recorded hop address.
    pub addr: SipAddr,
    /// Header parameters outside the angle brackets.
    pub params: Params,
}

impl fmt::Display for RecordRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}{}", RecordRoute::NAME, self.addr, self.params)
    }
}

impl SipHeaderParse for RecordRoute {
    const NAME: &'static str = "Record-Route";

    fn parse(scanner: &mut Scanner<'_>) -> Result<Self> {
        let addr = SipAddr::parse(scanner)?;
        let params = Params::parse(scanner)?;

        Ok(RecordRoute { addr, params })
    }
}
