use core::fmt;

use asip_util::Scanner;

use super::SipHeaderParse;
use crate::error::Result;
use crate::message::SipMethod;

/// The `CSeq` SIP header.
///
/// Orders requests within a dialog and matches responses to the request
/// they answer.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct CSeq {
    /// The sequence number.
    pub cseq: u32,
    /// The request method.
    pub method: SipMethod,
}

impl CSeq {
    /// Creates a new `CSeq` header.
    pub const fn new(cseq: u32, method: SipMethod) -> Self {
        Self { cseq, method }
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} {}", CSeq::NAME, self.cseq, self.method)
    }
}

impl SipHeaderParse for CSeq {
    const NAME: &'static str = "CSeq";

    fn parse(scanner: &mut Scanner<'_>) -> Result<Self> {
        scanner.skip_ws();
        let cseq = scanner.read_u32()?;
        scanner.skip_ws();
        let method = SipMethod::from(scanner.read_until_any(b" \t\r\n"));

        Ok(CSeq { cseq, method })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let cseq = CSeq::from_bytes(b"1826 REGISTER").unwrap();
        assert_eq!(cseq.cseq, 1826);
        assert_eq!(cseq.method, SipMethod::Register);
    }

    #[test]
    fn test_display() {
        let cseq = CSeq::new(314159, SipMethod::Invite);
        assert_eq!(cseq.to_string(), "CSeq: 314159 INVITE");
    }
}
