use std::fmt;

/// The transport token that appears in `Via` headers and `transport=`
/// URI parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportKind {
    /// Plain UDP.
    #[default]
    Udp,
    /// Plain TCP.
    Tcp,
    /// TCP with TLS.
    Tls,
    /// WebSocket.
    Ws,
    /// Secure WebSocket.
    Wss,
}

impl TransportKind {
    /// Returns the Via protocol token.
    pub const fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
            TransportKind::Ws => "WS",
            TransportKind::Wss => "WSS",
        }
    }

    /// Default port for this transport (5060, or 5061 when secure).
    pub const fn default_port(&self) -> u16 {
        if self.is_secure() {
            5061
        } else {
            5060
        }
    }

    /// Returns `true` for connection oriented transports.
    pub const fn is_reliable(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }

    /// Returns `true` for TLS protected transports.
    pub const fn is_secure(&self) -> bool {
        matches!(self, TransportKind::Tls | TransportKind::Wss)
    }
}

impl From<&[u8]> for TransportKind {
    fn from(value: &[u8]) -> Self {
        if value.eq_ignore_ascii_case(b"UDP") {
            TransportKind::Udp
        } else if value.eq_ignore_ascii_case(b"TCP") {
            TransportKind::Tcp
        } else if value.eq_ignore_ascii_case(b"TLS") {
            TransportKind::Tls
        } else if value.eq_ignore_ascii_case(b"WSS") {
            TransportKind::Wss
        } else if value.eq_ignore_ascii_case(b"WS") {
            TransportKind::Ws
        } else {
            TransportKind::Udp
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens() {
        assert_eq!(TransportKind::from(&b"udp"[..]), TransportKind::Udp);
        assert_eq!(TransportKind::from(&b"WSS"[..]), TransportKind::Wss);
        assert_eq!(TransportKind::Wss.as_str(), "WSS");
    }

    #[test]
    fn test_ports() {
        assert_eq!(TransportKind::Udp.default_port(), 5060);
        assert_eq!(TransportKind::Tls.default_port(), 5061);
        assert!(TransportKind::Tcp.is_reliable());
        assert!(!TransportKind::Udp.is_reliable());
    }
}
