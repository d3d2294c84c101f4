use core::fmt;

use asip_util::Scanner;

use super::SipHeaderParse;
use crate::message::{Host, Params, Scheme, SipAddr, TransportKind, Uri};
use crate::error::Result;

const EXPIRES_PARAM: &str = "expires";
const Q_PARAM: &str = "q";

/// The `Contact` SIP header.
///
/// Carries a URI at which the sender can be reached directly.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Contact {
    /// The contact address.
    pub addr: SipAddr,
    /// Header parameters (q, expires and extensions).
    pub params: Params,
}

impl Contact {
    /// Creates a new `Contact` from an address.
    pub fn new(addr: SipAddr) -> Self {
        Self {
            addr,
            params: Params::new(),
        }
    }

    /// Builds a contact for `user` reachable at `host_port` over the
    /// given transport.
    pub fn from_parts(user: Option<&str>, host: Host, port: u16, transport: TransportKind) -> Self {
        let mut uri = Uri::new(user, crate::message::HostPort::new(host, Some(port)));
        uri.params
            .set("transport", Some(&transport.as_str().to_ascii_lowercase()));

        Contact::new(SipAddr::Uri(uri))
    }

    /// Returns the URI of the contact.
    pub fn uri(&self) -> &Uri {
        self.addr.uri()
    }

    /// Returns the `expires` parameter, when present.
    pub fn expires(&self) -> Option<u32> {
        self.params.get(EXPIRES_PARAM).and_then(|e| e.parse().ok())
    }

    /// Returns the `q` preference parameter, when present.
    pub fn q(&self) -> Option<&asip_util::ArcStr> {
        self.params.get(Q_PARAM)
    }

    /// The `(scheme, transport, host, port)` tuple used as a peer hint
    /// when dialing out to this contact.
    pub fn details(&self) -> (Scheme, TransportKind, Host, u16) {
        let uri = self.uri();
        let transport = uri.transport_param().unwrap_or_else(|| {
            if uri.scheme == Scheme::Sips {
                TransportKind::Tls
            } else {
                TransportKind::Udp
            }
        });

        (
            uri.scheme.clone(),
            transport,
            uri.host_port.host.clone(),
            uri.port_or_default(),
        )
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}{}", Contact::NAME, self.addr, self.params)
    }
}

impl SipHeaderParse for Contact {
    const NAME: &'static str = "Contact";
    const SHORT_NAME: Option<&'static str> = Some("m");

    fn parse(scanner: &mut Scanner<'_>) -> Result<Self> {
        let addr = SipAddr::parse(scanner)?;
        let params = Params::parse(scanner)?;

        Ok(Contact { addr, params })
    }
}
