use core::fmt;
use std::net::IpAddr;

use asip_util::{ArcStr, Scanner};

use super::SipHeaderParse;
use crate::error::{Result, SipParserError};
use crate::message::{Host, HostPort, Params, TransportKind};
use crate::parser::SIPV2;

const BRANCH_PARAM: &str = "branch";
const RECEIVED_PARAM: &str = "received";
const RPORT_PARAM: &str = "rport";
const MADDR_PARAM: &str = "maddr";
const TTL_PARAM: &str = "ttl";

/// The `Via` SIP header.
///
/// Indicates the path taken by the request so far and the path that
/// should be followed in routing responses.
///
/// # Examples
/// ```
/// use asip::headers::{SipHeaderParse, Via};
///
/// let via = Via::from_bytes(b"SIP/2.0/UDP server10.biloxi.com;branch=z9hG4bKnashds8").unwrap();
/// assert_eq!(via.branch().unwrap(), "z9hG4bKnashds8");
/// ```
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct Via {
    transport: TransportKind,
    sent_by: HostPort,
    branch: Option<ArcStr>,
    received: Option<IpAddr>,
    rport: Option<u16>,
    maddr: Option<Host>,
    ttl: Option<u8>,
    params: Params,
}

impl Via {
    /// Creates a new `Via` header.
    pub fn new(transport: TransportKind, sent_by: HostPort, branch: Option<ArcStr>) -> Self {
        Self {
            transport,
            sent_by,
            branch,
            received: None,
            rport: None,
            maddr: None,
            ttl: None,
            params: Params::new(),
        }
    }

    /// Returns the transport protocol token.
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Returns the sent-by host and port.
    pub fn sent_by(&self) -> &HostPort {
        &self.sent_by
    }

    /// Sets the sent-by field.
    pub fn set_sent_by(&mut self, sent_by: HostPort) {
        self.sent_by = sent_by;
    }

    /// Returns the branch parameter.
    pub fn branch(&self) -> Option<&ArcStr> {
        self.branch.as_ref()
    }

    /// Returns the `received` parameter.
    pub fn received(&self) -> Option<IpAddr> {
        self.received
    }

    /// Sets the `received` parameter.
    pub fn set_received(&mut self, received: IpAddr) {
        self.received = Some(received);
    }

    /// Returns the `rport` parameter value, when it carries one.
    pub fn rport(&self) -> Option<u16> {
        self.rport
    }

    /// Returns the `maddr` parameter.
    pub fn maddr(&self) -> Option<&Host> {
        self.maddr.as_ref()
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}/{} {}",
            Via::NAME,
            SIPV2,
            self.transport,
            self.sent_by
        )?;

        if let Some(rport) = self.rport {
            write!(f, ";rport={}", rport)?;
        }
        if let Some(received) = &self.received {
            write!(f, ";received={received}")?;
        }
        if let Some(ttl) = &self.ttl {
            write!(f, ";ttl={ttl}")?;
        }
        if let Some(maddr) = &self.maddr {
            write!(f, ";maddr={maddr}")?;
        }
        if let Some(branch) = &self.branch {
            write!(f, ";branch={branch}")?;
        }
        write!(f, "{}", self.params)
    }
}

impl SipHeaderParse for Via {
    const NAME: &'static str = "Via";
    const SHORT_NAME: Option<&'static str> = Some("v");

    /*
     * Via               =  ( "Via" / "v" ) HCOLON via-parm *(COMMA via-parm)
     * via-parm          =  sent-protocol LWS sent-by *( SEMI via-params )
     * via-params        =  via-ttl / via-maddr
     *                      / via-received / via-branch
     *                      / via-extension
     * sent-protocol     =  protocol-name SLASH protocol-version
     *                      SLASH transport
     * sent-by           =  host [ COLON port ]
     */
    fn parse(scanner: &mut Scanner<'_>) -> Result<Self> {
        scanner.skip_ws();
        if !scanner.eat(SIPV2.as_bytes()) {
            return Err(SipParserError::new("Via must start with SIP/2.0").into());
        }
        scanner.expect(b'/')?;

        let transport = scanner.read_until_any(b" \t");
        let transport = TransportKind::from(transport);
        scanner.skip_ws();

        let sent_by = HostPort::parse(scanner)?;
        let mut params = Params::parse(scanner)?;

        let branch = params.remove(BRANCH_PARAM);
        let received = params
            .remove(RECEIVED_PARAM)
            .and_then(|r| r.parse().ok());
        let rport = match params.remove(RPORT_PARAM) {
            // An empty rport asks the server to fill it in; parse it as
            // absent and let the response path set it.
            Some(rport) if !rport.is_empty() => match rport.parse::<u16>() {
                Ok(port) => Some(port),
                Err(_) => return Err(SipParserError::new("Via param rport is invalid").into()),
            },
            _ => None,
        };
        let maddr = params.remove(MADDR_PARAM).map(|a| Host::from(a.as_str()));
        let ttl = params.remove(TTL_PARAM).and_then(|t| t.parse().ok());

        Ok(Via {
            transport,
            sent_by,
            branch,
            received,
            rport,
            maddr,
            ttl,
            params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let src = b"SIP/2.0/UDP bobspc.biloxi.com:5060;received=192.0.2.4;branch=z9hG4bKnashds7";
        let via = Via::from_bytes(src).unwrap();

        assert_eq!(via.transport(), TransportKind::Udp);
        assert_eq!(
            via.sent_by(),
            &HostPort {
                host: Host::DomainName("bobspc.biloxi.com".into()),
                port: Some(5060),
            }
        );
        assert_eq!(via.received(), Some("192.0.2.4".parse().unwrap()));
        assert_eq!(via.branch().unwrap(), "z9hG4bKnashds7");
    }

    #[test]
    fn test_parse_wss() {
        let via = Via::from_bytes(b"SIP/2.0/WSS df7jal23ls0d.invalid;branch=z9hG4bK123").unwrap();
        assert_eq!(via.transport(), TransportKind::Wss);
    }

    #[test]
    fn test_empty_rport_is_absent() {
        let via = Via::from_bytes(b"SIP/2.0/UDP host;rport;branch=z9hG4bK1").unwrap();
        assert_eq!(via.rport(), None);
    }

    #[test]
    fn test_display() {
        let via = Via::new(
            TransportKind::Udp,
            "server10.biloxi.com".parse().unwrap(),
            Some("z9hG4bKnashds8".into()),
        );
        assert_eq!(
            via.to_string(),
            "Via: SIP/2.0/UDP server10.biloxi.com;branch=z9hG4bKnashds8"
        );
    }

    #[test]
    fn test_roundtrip_with_received() {
        let mut via = Via::new(
            TransportKind::Tcp,
            "10.1.1.1:5070".parse().unwrap(),
            Some("z9hG4bKabc".into()),
        );
        via.set_received("10.2.2.2".parse().unwrap());

        let reparsed = Via::from_bytes(via.to_string().trim_start_matches("Via: ").as_bytes()).unwrap();
        assert_eq!(reparsed, via);
    }
}
