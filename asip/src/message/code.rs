use std::fmt;

/// A SIP response status code (RFC 3261 section 21).
///
/// The named variants cover the codes this library generates itself;
/// everything else round-trips through [`StatusCode::Custom`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// `Trying` status code.
    Trying,
    /// `Ringing` status code.
    Ringing,
    /// `Session Progress` status code.
    SessionProgress,
    /// `OK` status code.
    Ok,
    /// `Accepted` status code.
    Accepted,
    /// `Moved Temporarily` status code.
    MovedTemporarily,
    /// `Bad Request` status code.
    BadRequest,
    /// `Unauthorized` status code.
    Unauthorized,
    /// `Forbidden` status code.
    Forbidden,
    /// `Not Found` status code.
    NotFound,
    /// `Method Not Allowed` status code.
    MethodNotAllowed,
    /// `Proxy Authentication Required` status code.
    ProxyAuthenticationRequired,
    /// `Request Timeout` status code.
    RequestTimeout,
    /// `Temporarily Unavailable` status code.
    TemporarilyUnavailable,
    /// `Call/Transaction Does Not Exist` status code.
    CallOrTransactionDoesNotExist,
    /// `Busy Here` status code.
    BusyHere,
    /// `Request Terminated` status code.
    RequestTerminated,
    /// `Server Internal Error` status code.
    ServerInternalError,
    /// `Not Implemented` status code.
    NotImplemented,
    /// `Service Unavailable` status code.
    ServiceUnavailable,
    /// `Busy Everywhere` status code.
    BusyEverywhere,
    /// `Decline` status code.
    Decline,
    /// A non-standard or unlisted status code.
    Custom(u16),
}

impl StatusCode {
    /// Returns the default reason text for the status code.
    pub const fn reason(&self) -> &'static str {
        match self {
            StatusCode::Trying => "Trying",
            StatusCode::Ringing => "Ringing",
            StatusCode::SessionProgress => "Session Progress",
            StatusCode::Ok => "OK",
            StatusCode::Accepted => "Accepted",
            StatusCode::MovedTemporarily => "Moved Temporarily",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Unauthorized => "Unauthorized",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::ProxyAuthenticationRequired => "Proxy Authentication Required",
            StatusCode::RequestTimeout => "Request Timeout",
            StatusCode::TemporarilyUnavailable => "Temporarily Unavailable",
            StatusCode::CallOrTransactionDoesNotExist => "Call/Transaction Does Not Exist",
            StatusCode::BusyHere => "Busy Here",
            StatusCode::RequestTerminated => "Request Terminated",
            StatusCode::ServerInternalError => "Server Internal Error",
            StatusCode::NotImplemented => "Not Implemented",
            StatusCode::ServiceUnavailable => "Service Unavailable",
            StatusCode::BusyEverywhere => "Busy Everywhere",
            StatusCode::Decline => "Decline",
            StatusCode::Custom(_) => "Unknown",
        }
    }

    /// Converts the `StatusCode` into its numeric code.
    pub const fn as_u16(self) -> u16 {
        match self {
            StatusCode::Trying => 100,
            StatusCode::Ringing => 180,
            StatusCode::SessionProgress => 183,
            StatusCode::Ok => 200,
            StatusCode::Accepted => 202,
            StatusCode::MovedTemporarily => 302,
            StatusCode::BadRequest => 400,
            StatusCode::Unauthorized => 401,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::MethodNotAllowed => 405,
            StatusCode::ProxyAuthenticationRequired => 407,
            StatusCode::RequestTimeout => 408,
            StatusCode::TemporarilyUnavailable => 480,
            StatusCode::CallOrTransactionDoesNotExist => 481,
            StatusCode::BusyHere => 486,
            StatusCode::RequestTerminated => 487,
            StatusCode::ServerInternalError => 500,
            StatusCode::NotImplemented => 501,
            StatusCode::ServiceUnavailable => 503,
            StatusCode::BusyEverywhere => 600,
            StatusCode::Decline => 603,
            StatusCode::Custom(code) => code,
        }
    }

    /// Returns `true` for provisional codes (100 to 199).
    #[inline]
    pub const fn is_provisional(&self) -> bool {
        let code = self.as_u16();
        code >= 100 && code < 200
    }

    /// Returns `true` for final codes (200 and above).
    #[inline]
    pub const fn is_final(&self) -> bool {
        self.as_u16() >= 200
    }

    /// Returns `true` for successful codes (200 to 299).
    #[inline]
    pub const fn is_success(&self) -> bool {
        let code = self.as_u16();
        code >= 200 && code < 300
    }
}

impl From<u16> for StatusCode {
    fn from(code: u16) -> Self {
        match code {
            100 => StatusCode::Trying,
            180 => StatusCode::Ringing,
            183 => StatusCode::SessionProgress,
            200 => StatusCode::Ok,
            202 => StatusCode::Accepted,
            302 => StatusCode::MovedTemporarily,
            400 => StatusCode::BadRequest,
            401 => StatusCode::Unauthorized,
            403 => StatusCode::Forbidden,
            404 => StatusCode::NotFound,
            405 => StatusCode::MethodNotAllowed,
            407 => StatusCode::ProxyAuthenticationRequired,
            408 => StatusCode::RequestTimeout,
            480 => StatusCode::TemporarilyUnavailable,
            481 => StatusCode::CallOrTransactionDoesNotExist,
            486 => StatusCode::BusyHere,
            487 => StatusCode::RequestTerminated,
            500 => StatusCode::ServerInternalError,
            501 => StatusCode::NotImplemented,
            503 => StatusCode::ServiceUnavailable,
            600 => StatusCode::BusyEverywhere,
            603 => StatusCode::Decline,
            other => StatusCode::Custom(other),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        for code in [100u16, 180, 200, 401, 407, 481, 487, 501, 603] {
            assert_eq!(StatusCode::from(code).as_u16(), code);
        }
        assert_eq!(StatusCode::from(699u16), StatusCode::Custom(699));
    }

    #[test]
    fn test_classes() {
        assert!(StatusCode::Trying.is_provisional());
        assert!(!StatusCode::Trying.is_final());
        assert!(StatusCode::Ok.is_success());
        assert!(StatusCode::BusyHere.is_final());
        assert!(!StatusCode::BusyHere.is_success());
    }
}
