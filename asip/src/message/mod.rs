#![deny(missing_docs)]
//! SIP message types.
//!
//! The module provides the [`SipMsg`] enum that can be a [`SipMsg::Request`]
//! or a [`SipMsg::Response`] and represents one parsed SIP message.

use bytes::Bytes;

use crate::headers::{CSeq, Headers};
use crate::parser::SIPV2;

pub mod auth;

mod code;
mod method;
mod params;
mod protocol;
mod uri;

pub use code::*;
pub use method::*;
pub use params::*;
pub use protocol::*;
pub use uri::*;

/// A SIP message, either Request or Response.
#[derive(Debug, Clone, PartialEq)]
pub enum SipMsg {
    /// A SIP Request.
    Request(Request),
    /// A SIP Response.
    Response(Response),
}

impl SipMsg {
    /// Returns `true` if this message is a [`Request`].
    pub const fn is_request(&self) -> bool {
        matches!(self, SipMsg::Request(_))
    }

    /// Returns `true` if this message is a [`Response`].
    pub const fn is_response(&self) -> bool {
        matches!(self, SipMsg::Response(_))
    }

    /// Returns a reference to the [`Request`], if this is one.
    pub fn request(&self) -> Option<&Request> {
        if let SipMsg::Request(request) = self {
            Some(request)
        } else {
            None
        }
    }

    /// Returns a reference to the [`Response`], if this is one.
    pub fn response(&self) -> Option<&Response> {
        if let SipMsg::Response(response) = self {
            Some(response)
        } else {
            None
        }
    }

    /// Returns a reference to the headers of the message.
    pub fn headers(&self) -> &Headers {
        match self {
            SipMsg::Request(req) => &req.headers,
            SipMsg::Response(res) => &res.headers,
        }
    }

    /// Returns a mutable reference to the headers of the message.
    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            SipMsg::Request(req) => &mut req.headers,
            SipMsg::Response(res) => &mut res.headers,
        }
    }

    /// Returns the message body, if present.
    pub fn body(&self) -> Option<&Bytes> {
        match self {
            SipMsg::Request(request) => request.body.as_ref(),
            SipMsg::Response(response) => response.body.as_ref(),
        }
    }

    /// Sets the message body. `None` removes it.
    pub fn set_body(&mut self, body: Option<Bytes>) {
        match self {
            SipMsg::Request(req) => req.body = body,
            SipMsg::Response(res) => res.body = body,
        }
    }

    /// The CSeq sequence number, when a `CSeq` header is present.
    pub fn cseq(&self) -> Option<u32> {
        self.headers().cseq().map(|c| c.cseq)
    }

    /// The method this message belongs to, derived from the `CSeq` header
    /// for responses and from the request line for requests.
    pub fn method(&self) -> Option<SipMethod> {
        match self {
            SipMsg::Request(req) => Some(req.method()),
            SipMsg::Response(res) => res.headers.cseq().map(|c| c.method),
        }
    }
}

impl From<Request> for SipMsg {
    fn from(value: Request) -> Self {
        SipMsg::Request(value)
    }
}

impl From<Response> for SipMsg {
    fn from(value: Response) -> Self {
        SipMsg::Response(value)
    }
}

/// Represents a SIP Request-Line.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestLine {
    /// The SIP method associated with the request.
    pub method: SipMethod,
    /// The Request-URI indicating the target of the request.
    pub uri: Uri,
}

impl std::fmt::Display for RequestLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {SIPV2}\r\n", self.method, self.uri)
    }
}

/// A SIP Request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// The Request-Line of the message.
    pub req_line: RequestLine,
    /// All headers present in the message.
    pub headers: Headers,
    /// The message body, if present.
    pub body: Option<Bytes>,
}

impl Request {
    /// Creates a new SIP `Request` with empty headers and no body.
    pub fn new(method: SipMethod, uri: Uri) -> Self {
        Request {
            req_line: RequestLine { method, uri },
            headers: Default::default(),
            body: None,
        }
    }

    /// Creates a new `Request` with the given headers.
    pub const fn new_with_headers(method: SipMethod, uri: Uri, headers: Headers) -> Self {
        Self {
            req_line: RequestLine { method, uri },
            headers,
            body: None,
        }
    }

    /// Returns the SIP method of the request.
    pub fn method(&self) -> SipMethod {
        self.req_line.method
    }

    /// Returns the request URI.
    pub fn uri(&self) -> &Uri {
        &self.req_line.uri
    }

    /// The CSeq sequence number, when a `CSeq` header is present.
    pub fn cseq(&self) -> Option<&CSeq> {
        self.headers.cseq()
    }
}

/// Represents a SIP Status-Line.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusLine {
    /// The status code of the response.
    pub code: StatusCode,
    /// The reason phrase explaining the status code.
    pub reason: String,
}

impl StatusLine {
    /// Creates a new `StatusLine` from the given code and reason.
    pub fn new(code: StatusCode, reason: &str) -> Self {
        StatusLine {
            code,
            reason: reason.to_string(),
        }
    }
}

impl std::fmt::Display for StatusLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{SIPV2} {} {}\r\n", self.code.as_u16(), self.reason)
    }
}

/// A SIP Response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// The Status-Line of the message.
    pub status_line: StatusLine,
    /// All headers present in the message.
    pub headers: Headers,
    /// The message body, if present.
    pub body: Option<Bytes>,
}

impl Response {
    /// Creates a new SIP `Response` with empty headers and no body.
    pub fn new(code: StatusCode) -> Self {
        Self {
            status_line: StatusLine::new(code, code.reason()),
            headers: Default::default(),
            body: None,
        }
    }

    /// Creates a new `Response` with the given headers.
    pub fn new_with_headers(code: StatusCode, headers: Headers) -> Self {
        Self {
            status_line: StatusLine::new(code, code.reason()),
            headers,
            body: None,
        }
    }

    /// Returns the response status code.
    pub fn code(&self) -> StatusCode {
        self.status_line.code
    }

    /// Returns the reason phrase.
    pub fn reason(&self) -> &str {
        &self.status_line.reason
    }

    /// The CSeq header, when present.
    pub fn cseq(&self) -> Option<&CSeq> {
        self.headers.cseq()
    }

    /// The method this response answers, from the `CSeq` header.
    pub fn cseq_method(&self) -> Option<SipMethod> {
        self.headers.cseq().map(|c| c.method)
    }

    /// Appends headers from another collection to the current headers.
    pub fn append_headers(&mut self, other: &mut Headers) {
        self.headers.append(other);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_line_display() {
        let uri = Uri::from_static("sip:bob@biloxi.com").unwrap();
        let line = RequestLine {
            method: SipMethod::Invite,
            uri,
        };
        assert_eq!(line.to_string(), "INVITE sip:bob@biloxi.com SIP/2.0\r\n");
    }

    #[test]
    fn test_status_line_display() {
        let line = StatusLine::new(StatusCode::Ok, "OK");
        assert_eq!(line.to_string(), "SIP/2.0 200 OK\r\n");
    }

    #[test]
    fn test_msg_conversions() {
        let uri = Uri::from_static("sip:alice@example.com").unwrap();
        let msg: SipMsg = Request::new(SipMethod::Options, uri).into();
        assert!(msg.is_request());
        assert_eq!(msg.method(), Some(SipMethod::Options));

        let msg: SipMsg = Response::new(StatusCode::Ok).into();
        assert!(msg.is_response());
    }
}
