use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;

use asip_util::{ArcStr, Scanner};

use super::{Params, TransportKind};
use crate::error::{Error, Result, SipParserError};

/// The URI scheme.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Scheme {
    /// `sip:`
    #[default]
    Sip,
    /// `sips:`
    Sips,
    /// Any other scheme matching `[A-Za-z][A-Za-z0-9+\-.]*`.
    Other(ArcStr),
}

impl Scheme {
    /// Returns the scheme text without the trailing colon.
    pub fn as_str(&self) -> &str {
        match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
            Scheme::Other(s) => s,
        }
    }

    fn parse(token: &str) -> Result<Self> {
        let mut chars = token.chars();
        let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
            && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if !valid {
            return Err(SipParserError::new(format!("invalid scheme: {:?}", token)).into());
        }
        Ok(if token.eq_ignore_ascii_case("sip") {
            Scheme::Sip
        } else if token.eq_ignore_ascii_case("sips") {
            Scheme::Sips
        } else {
            Scheme::Other(token.into())
        })
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The `user[:password]` part of a URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    /// The user part.
    pub user: ArcStr,
    /// The optional password part.
    pub password: Option<ArcStr>,
}

impl fmt::Display for UserInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user)?;
        if let Some(password) = &self.password {
            write!(f, ":{}", password)?;
        }
        Ok(())
    }
}

/// A host: either a domain name or an IP address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    /// A DNS name that still needs resolution.
    DomainName(ArcStr),
    /// A literal IP address.
    IpAddr(IpAddr),
}

impl Host {
    /// Returns the host as a string slice or formatted address.
    pub fn to_host_string(&self) -> String {
        match self {
            Host::DomainName(name) => name.to_string(),
            Host::IpAddr(ip) => ip.to_string(),
        }
    }
}

impl Default for Host {
    fn default() -> Self {
        Host::DomainName("localhost".into())
    }
}

impl From<&str> for Host {
    fn from(s: &str) -> Self {
        match s.parse::<IpAddr>() {
            Ok(ip) => Host::IpAddr(ip),
            Err(_) => Host::DomainName(s.into()),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::DomainName(name) => write!(f, "{}", name),
            Host::IpAddr(IpAddr::V6(ip)) => write!(f, "[{}]", ip),
            Host::IpAddr(ip) => write!(f, "{}", ip),
        }
    }
}

/// A `host[:port]` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct HostPort {
    /// The host part.
    pub host: Host,
    /// The port, when given explicitly.
    pub port: Option<u16>,
}

impl HostPort {
    /// Creates a new `HostPort`.
    pub fn new(host: Host, port: Option<u16>) -> Self {
        Self { host, port }
    }

    /// Parses `host[:port]`, accepting bracketed IPv6 literals.
    pub fn parse(scanner: &mut Scanner<'_>) -> Result<Self> {
        let host = if scanner.peek() == Some(b'[') {
            scanner.bump();
            let ip = scanner.read_until(b']');
            let ip = std::str::from_utf8(ip)?;
            let ip: Ipv6Addr = ip
                .parse()
                .map_err(|_| Error::from(SipParserError::new(format!("invalid IPv6 host: {:?}", ip))))?;
            scanner.expect(b']')?;
            Host::IpAddr(IpAddr::V6(ip))
        } else {
            let host = scanner.read_until_any(b":;?&>, \t\r\n/");
            if host.is_empty() {
                return Err(SipParserError::new("empty host").into());
            }
            Host::from(std::str::from_utf8(host)?)
        };

        let port = if scanner.peek() == Some(b':') {
            scanner.bump();
            Some(scanner.read_u16()?)
        } else {
            None
        };

        Ok(HostPort { host, port })
    }
}

impl From<std::net::SocketAddr> for HostPort {
    fn from(addr: std::net::SocketAddr) -> Self {
        HostPort {
            host: Host::IpAddr(addr.ip()),
            port: Some(addr.port()),
        }
    }
}

impl FromStr for HostPort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(&mut Scanner::new(s.as_bytes()))
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

/// A SIP URI: `scheme:[user[:password]@]host[:port][;params][?headers]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Uri {
    /// The URI scheme.
    pub scheme: Scheme,
    /// The optional user info.
    pub user: Option<UserInfo>,
    /// Host and optional port.
    pub host_port: HostPort,
    /// URI parameters.
    pub params: Params,
    /// URI headers (the `?name=value&...` trailer).
    pub headers: Params,
}

impl Uri {
    /// Creates a `sip:` URI with the given user and host.
    pub fn new(user: Option<&str>, host_port: HostPort) -> Self {
        Uri {
            scheme: Scheme::Sip,
            user: user.map(|u| UserInfo {
                user: u.into(),
                password: None,
            }),
            host_port,
            params: Params::new(),
            headers: Params::new(),
        }
    }

    /// Parses a URI from a static string.
    pub fn from_static(s: &'static str) -> Result<Self> {
        Self::parse(&mut Scanner::new(s.as_bytes()))
    }

    /// Returns the `transport=` URI parameter, if present.
    pub fn transport_param(&self) -> Option<TransportKind> {
        self.params.get("transport").map(|t| t.as_bytes().into())
    }

    /// The user part, when present.
    pub fn user_str(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.user.as_str())
    }

    /// The port, defaulted by scheme when absent (5060 for sip, 5061 for
    /// sips).
    pub fn port_or_default(&self) -> u16 {
        self.host_port.port.unwrap_or(match self.scheme {
            Scheme::Sips => 5061,
            _ => 5060,
        })
    }

    /// The URI without display name, brackets or headers, as used in
    /// digest `uri=` fields.
    pub fn short_uri(&self) -> String {
        let mut out = format!("{}:", self.scheme);
        if let Some(user) = &self.user {
            out.push_str(&user.user);
            out.push('@');
        }
        out.push_str(&self.host_port.to_string());
        out
    }

    /// Parses a URI.
    pub fn parse(scanner: &mut Scanner<'_>) -> Result<Self> {
        let scheme = scanner.read_until(b':');
        let scheme = Scheme::parse(std::str::from_utf8(scheme)?)?;
        scanner.expect(b':')?;

        // The user part is present only when an '@' occurs before the end
        // of the addr-spec.
        let has_user = scanner
            .rest()
            .iter()
            .take_while(|&&b| !matches!(b, b';' | b'?' | b'>' | b' ' | b'\t' | b'\r' | b'\n' | b','))
            .any(|&b| b == b'@');

        let user = if has_user {
            let user = scanner.read_until_any(b":@");
            let user = std::str::from_utf8(user)?;
            let password = if scanner.peek() == Some(b':') {
                scanner.bump();
                let password = scanner.read_until(b'@');
                Some(ArcStr::from(std::str::from_utf8(password)?))
            } else {
                None
            };
            scanner.expect(b'@')?;
            Some(UserInfo {
                user: user.into(),
                password,
            })
        } else {
            None
        };

        let host_port = HostPort::parse(scanner)?;
        let params = Params::parse(scanner)?;

        let mut headers = Params::new();
        if scanner.peek() == Some(b'?') {
            loop {
                scanner.bump();
                let name = scanner.read_until_any(b"=&> \t\r\n,");
                if name.is_empty() {
                    break;
                }
                let name = std::str::from_utf8(name)?;
                let value = if scanner.peek() == Some(b'=') {
                    scanner.bump();
                    let value = scanner.read_until_any(b"&> \t\r\n,");
                    Some(std::str::from_utf8(value)?)
                } else {
                    None
                };
                headers.set(name, value);
                if scanner.peek() != Some(b'&') {
                    break;
                }
            }
        }

        Ok(Uri {
            scheme,
            user,
            host_port,
            params,
            headers,
        })
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(&mut Scanner::new(s.as_bytes()))
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.host_port)?;
        write!(f, "{}", self.params)?;

        let mut sep = '?';
        for param in self.headers.iter() {
            match &param.value {
                Some(value) => write!(f, "{}{}={}", sep, param.name, value)?,
                None => write!(f, "{}{}", sep, param.name)?,
            }
            sep = '&';
        }
        Ok(())
    }
}

/// A named address: `display-name? <uri>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    /// The optional display name, without quotes.
    pub display: Option<ArcStr>,
    /// The wrapped URI.
    pub uri: Uri,
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(display) = &self.display {
            write!(f, "\"{}\" ", display)?;
        }
        write!(f, "<{}>", self.uri)
    }
}

/// An addressable party: a bare [`Uri`] or a [`NameAddr`].
///
/// This is the address form carried by `From`, `To`, `Contact`, `Route`
/// and `Record-Route` headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipAddr {
    /// A plain SIP URI (e.g. `sip:user@example.com`).
    Uri(Uri),
    /// A named address (e.g. `"Alice" <sip:alice@example.com>`).
    NameAddr(NameAddr),
}

impl SipAddr {
    /// Returns a reference to the inner [`Uri`].
    pub fn uri(&self) -> &Uri {
        match self {
            SipAddr::Uri(uri) => uri,
            SipAddr::NameAddr(name_addr) => &name_addr.uri,
        }
    }

    /// Returns a mutable reference to the inner [`Uri`].
    pub fn uri_mut(&mut self) -> &mut Uri {
        match self {
            SipAddr::Uri(uri) => uri,
            SipAddr::NameAddr(name_addr) => &mut name_addr.uri,
        }
    }

    /// Returns the display part, if present.
    pub fn display(&self) -> Option<&str> {
        match self {
            SipAddr::Uri(_) => None,
            SipAddr::NameAddr(name_addr) => name_addr.display.as_deref(),
        }
    }

    /// Parses `display-name? ('<' URI '>' | URI)`.
    ///
    /// The display name may be a double-quoted string or a run of bare
    /// tokens before the `<`.
    pub fn parse(scanner: &mut Scanner<'_>) -> Result<Self> {
        scanner.skip_ws();

        if scanner.peek() == Some(b'"') {
            scanner.bump();
            let display = scanner.read_until(b'"');
            let display = std::str::from_utf8(display)?;
            scanner.expect(b'"')?;
            scanner.skip_ws();
            scanner.expect(b'<')?;
            let uri = Uri::parse(scanner)?;
            scanner.expect(b'>')?;
            return Ok(SipAddr::NameAddr(NameAddr {
                display: Some(display.into()),
                uri,
            }));
        }

        if scanner.peek() == Some(b'<') {
            scanner.bump();
            let uri = Uri::parse(scanner)?;
            scanner.expect(b'>')?;
            return Ok(SipAddr::NameAddr(NameAddr { display: None, uri }));
        }

        // A bare token display name is only possible when a '<' follows
        // before the end of the field.
        let angle = scanner
            .rest()
            .iter()
            .position(|&b| b == b'<' || b == b'\r' || b == b'\n');

        match angle {
            Some(pos) if scanner.rest()[pos] == b'<' => {
                let display = scanner.read_until(b'<');
                let display = std::str::from_utf8(display)?.trim();
                scanner.expect(b'<')?;
                let uri = Uri::parse(scanner)?;
                scanner.expect(b'>')?;
                Ok(SipAddr::NameAddr(NameAddr {
                    display: if display.is_empty() {
                        None
                    } else {
                        Some(display.into())
                    },
                    uri,
                }))
            }
            _ => Ok(SipAddr::Uri(Uri::parse(scanner)?)),
        }
    }
}

impl FromStr for SipAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(&mut Scanner::new(s.as_bytes()))
    }
}

impl fmt::Display for SipAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipAddr::Uri(uri) => write!(f, "{}", uri),
            SipAddr::NameAddr(name_addr) => write!(f, "{}", name_addr),
        }
    }
}

impl From<Uri> for SipAddr {
    fn from(uri: Uri) -> Self {
        SipAddr::Uri(uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_uri() {
        let uri: Uri = "sips:alice:secret@example.com:5061;transport=tls?subject=call"
            .parse()
            .unwrap();

        assert_eq!(uri.scheme, Scheme::Sips);
        let user = uri.user.as_ref().unwrap();
        assert_eq!(user.user, "alice");
        assert_eq!(user.password.as_ref().unwrap(), "secret");
        assert_eq!(uri.host_port.host, Host::DomainName("example.com".into()));
        assert_eq!(uri.host_port.port, Some(5061));
        assert_eq!(uri.transport_param(), Some(TransportKind::Tls));
        assert_eq!(uri.headers.get("subject").unwrap(), "call");
    }

    #[test]
    fn test_parse_minimal_uri() {
        let uri: Uri = "sip:10.0.0.1".parse().unwrap();

        assert_eq!(uri.scheme, Scheme::Sip);
        assert!(uri.user.is_none());
        assert_eq!(uri.host_port.host, Host::IpAddr("10.0.0.1".parse().unwrap()));
        assert_eq!(uri.port_or_default(), 5060);
    }

    #[test]
    fn test_parse_ipv6_host() {
        let uri: Uri = "sip:bob@[2001:db8::1]:5080".parse().unwrap();
        assert_eq!(
            uri.host_port.host,
            Host::IpAddr("2001:db8::1".parse().unwrap())
        );
        assert_eq!(uri.host_port.port, Some(5080));
    }

    #[test]
    fn test_invalid_scheme() {
        assert!("1sip:bob@example.com".parse::<Uri>().is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        let src = "sip:alice@example.com:5060;transport=udp";
        let uri: Uri = src.parse().unwrap();
        assert_eq!(uri.to_string(), src);
    }

    #[test]
    fn test_addr_quoted_display() {
        let addr: SipAddr = "\"Alice Wonderland\" <sip:alice@example.com>;tag=x"
            .parse()
            .unwrap();
        assert_eq!(addr.display(), Some("Alice Wonderland"));
        assert_eq!(addr.uri().user_str(), Some("alice"));
    }

    #[test]
    fn test_addr_token_display() {
        let addr: SipAddr = "Bob <sip:bob@biloxi.com>".parse().unwrap();
        assert_eq!(addr.display(), Some("Bob"));
    }

    #[test]
    fn test_addr_bare_uri() {
        let addr: SipAddr = "sip:bob@biloxi.com".parse().unwrap();
        assert_matches!(addr, SipAddr::Uri(_));
    }

    #[test]
    fn test_angle_uri_keeps_params_inside() {
        // Parameters inside the brackets belong to the URI, not the header.
        let addr: SipAddr = "<sip:bob@biloxi.com;transport=tcp>".parse().unwrap();
        assert_eq!(addr.uri().transport_param(), Some(TransportKind::Tcp));
    }

    #[test]
    fn test_short_uri() {
        let uri: Uri = "sip:bob@s;transport=udp".parse().unwrap();
        assert_eq!(uri.short_uri(), "sip:bob@s");
    }
}
