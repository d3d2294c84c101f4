use core::fmt;

use asip_util::Scanner;

use super::SipHeaderParse;
use crate::error::Result;

/// The `Content-Length` SIP header.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ContentLength(u32);

impl ContentLength {
    /// Creates a new `Content-Length` header.
    pub const fn new(len: u32) -> Self {
        Self(len)
    }

    /// Returns the length value.
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ContentLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", ContentLength::NAME, self.0)
    }
}

impl SipHeaderParse for ContentLength {
    const NAME: &'static str = "Content-Length";
    const SHORT_NAME: Option<&'static str> = Some("l");

    fn parse(scanner: &mut Scanner<'_>) -> Result<Self> {
        scanner.skip_ws();
        Ok(ContentLength(scanner.read_u32()?))
    }
}
