//! The SIP message parser.
//!
//! Single pass over the packet bytes: start-line, headers until the empty
//! line, then exactly `Content-Length` body bytes.

use bytes::Bytes;

use asip_util::Scanner;

use crate::error::{Result, SipParserError};
use crate::headers::{Header, Headers, RecordRoute, Route, SipHeaderParse, Via};
use crate::message::{
    Request, RequestLine, Response, SipMethod, SipMsg, StatusLine, Uri,
};

/// The SIP version token used on every start-line.
pub const SIPV2: &str = "SIP/2.0";

/// A parser over one packet worth of bytes.
pub struct Parser<'a> {
    scanner: Scanner<'a>,
}

impl<'a> Parser<'a> {
    /// Creates a parser over `src`.
    pub fn new(src: &'a [u8]) -> Self {
        Self {
            scanner: Scanner::new(src),
        }
    }

    /// Parses a complete SIP message.
    ///
    /// Fails with a parse error on a malformed start-line, a malformed
    /// header line, or a body shorter than its `Content-Length`.
    pub fn parse_sip_msg(&mut self) -> Result<SipMsg> {
        if self.scanner.starts_with(SIPV2.as_bytes()) {
            let status_line = self.parse_status_line()?;
            let headers = self.parse_headers()?;
            let body = self.parse_body(&headers)?;

            Ok(SipMsg::Response(Response {
                status_line,
                headers,
                body,
            }))
        } else {
            let req_line = self.parse_request_line()?;
            let headers = self.parse_headers()?;
            let body = self.parse_body(&headers)?;

            Ok(SipMsg::Request(Request {
                req_line,
                headers,
                body,
            }))
        }
    }

    /*
     * Request-Line  =  Method SP Request-URI SP SIP-Version CRLF
     */
    fn parse_request_line(&mut self) -> Result<RequestLine> {
        let method = self.scanner.read_until(b' ');
        let method = SipMethod::from(method);
        self.scanner.expect(b' ')?;

        let uri = Uri::parse(&mut self.scanner)?;
        self.scanner.expect(b' ')?;

        if !self.scanner.eat(SIPV2.as_bytes()) {
            return Err(SipParserError::new("malformed request line: missing SIP/2.0").into());
        }
        self.eat_line_end()?;

        Ok(RequestLine { method, uri })
    }

    /*
     * Status-Line  =  SIP-Version SP Status-Code SP Reason-Phrase CRLF
     */
    fn parse_status_line(&mut self) -> Result<StatusLine> {
        if !self.scanner.eat(SIPV2.as_bytes()) {
            return Err(SipParserError::new("malformed status line: missing SIP/2.0").into());
        }
        self.scanner.expect(b' ')?;

        let code = self.scanner.read_u32()?;
        if !(100..700).contains(&code) {
            return Err(SipParserError::new(format!("status code out of range: {}", code)).into());
        }
        self.scanner.expect(b' ')?;

        let reason = self.scanner.read_until_any(b"\r\n");
        let reason = std::str::from_utf8(reason)?.to_string();
        self.eat_line_end()?;

        Ok(StatusLine {
            code: (code as u16).into(),
            reason,
        })
    }

    fn parse_headers(&mut self) -> Result<Headers> {
        let mut headers = Headers::with_capacity(12);

        loop {
            // The empty line ends the header section.
            if self.scanner.eat(b"\r\n") || self.scanner.eat(b"\n") {
                break;
            }
            if self.scanner.is_eof() {
                break;
            }

            let name = self.scanner.read_until_any(b":\r\n");
            if self.scanner.peek() != Some(b':') {
                return Err(SipParserError::new("header line without colon").into());
            }
            let name = std::str::from_utf8(name)?.trim();
            self.scanner.bump();
            self.scanner.skip_ws();

            let value = self.scanner.read_until_any(b"\r\n");
            self.eat_line_end()?;

            // Via, Route and Record-Route may carry several values on one
            // line; fold them into repeated entries.
            if Via::matches_name(name) || Route::matches_name(name) || RecordRoute::matches_name(name)
            {
                for part in value.split(|&b| b == b',') {
                    headers.push(Header::parse_value(name, trim_bytes(part))?);
                }
            } else {
                headers.push(Header::parse_value(name, value)?);
            }
        }

        Ok(headers)
    }

    fn parse_body(&mut self, headers: &Headers) -> Result<Option<Bytes>> {
        match headers.content_length() {
            Some(0) => Ok(None),
            Some(len) => {
                let len = len as usize;
                let body = self
                    .scanner
                    .read_n(len)
                    .map_err(|_| SipParserError::new("body shorter than Content-Length"))?;
                Ok(Some(Bytes::copy_from_slice(body)))
            }
            None => {
                let rest = self.scanner.rest();
                if rest.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(Bytes::copy_from_slice(rest)))
                }
            }
        }
    }

    fn eat_line_end(&mut self) -> Result<()> {
        if self.scanner.eat(b"\r\n") || self.scanner.eat(b"\n") || self.scanner.is_eof() {
            Ok(())
        } else {
            Err(SipParserError::new("missing line terminator").into())
        }
    }
}

fn trim_bytes(mut src: &[u8]) -> &[u8] {
    while let Some((b' ' | b'\t', rest)) = src.split_first() {
        src = rest;
    }
    while let Some((b' ' | b'\t', rest)) = src.split_last() {
        src = rest;
    }
    src
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StatusCode;

    const REGISTER_MSG: &[u8] = b"REGISTER sip:registrar.biloxi.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP bobspc.biloxi.com:5060;branch=z9hG4bKnashds7\r\n\
        Max-Forwards: 70\r\n\
        To: Bob <sip:bob@biloxi.com>\r\n\
        From: Bob <sip:bob@biloxi.com>;tag=456248\r\n\
        Call-ID: 843817637684230@998sdasdh09\r\n\
        CSeq: 1826 REGISTER\r\n\
        Contact: <sip:bob@192.0.2.4>\r\n\
        Expires: 7200\r\n\
        Content-Length: 0\r\n\r\n";

    #[test]
    fn test_parse_request() {
        let msg = Parser::new(REGISTER_MSG).parse_sip_msg().unwrap();

        let SipMsg::Request(request) = msg else {
            panic!("expected a request");
        };
        assert_eq!(request.method(), SipMethod::Register);
        assert_eq!(request.uri().host_port.host.to_host_string(), "registrar.biloxi.com");
        assert_eq!(request.headers.len(), 9);
        assert_eq!(request.headers.cseq().unwrap().cseq, 1826);
        assert_eq!(
            request.headers.top_via().unwrap().branch().unwrap(),
            "z9hG4bKnashds7"
        );
        assert_eq!(request.headers.from_hdr().unwrap().tag().unwrap(), "456248");
        assert!(request.body.is_none());
    }

    #[test]
    fn test_parse_response_with_body() {
        let src = b"SIP/2.0 200 OK\r\n\
            Via: SIP/2.0/UDP client.atlanta.com;branch=z9hG4bK74bf9\r\n\
            From: <sip:alice@atlanta.com>;tag=9fxced76sl\r\n\
            To: <sip:bob@biloxi.com>;tag=8321234356\r\n\
            Call-ID: 3848276298220188511@atlanta.com\r\n\
            CSeq: 1 INVITE\r\n\
            Content-Length: 4\r\n\r\nbody";
        let msg = Parser::new(src).parse_sip_msg().unwrap();

        let SipMsg::Response(response) = msg else {
            panic!("expected a response");
        };
        assert_eq!(response.code(), StatusCode::Ok);
        assert_eq!(response.reason(), "OK");
        assert_eq!(response.cseq_method(), Some(SipMethod::Invite));
        assert_eq!(response.body.as_deref(), Some(&b"body"[..]));
    }

    #[test]
    fn test_truncated_body_fails() {
        let src = b"SIP/2.0 200 OK\r\n\
            CSeq: 1 OPTIONS\r\n\
            Content-Length: 10\r\n\r\nshort";
        assert!(Parser::new(src).parse_sip_msg().is_err());
    }

    #[test]
    fn test_malformed_start_line_fails() {
        assert!(Parser::new(b"NOT A SIP MESSAGE\r\n\r\n").parse_sip_msg().is_err());
        assert!(Parser::new(b"SIP/2.0 999\r\n\r\n").parse_sip_msg().is_err());
    }

    #[test]
    fn test_folded_via_values() {
        let src = b"BYE sip:bob@biloxi.com SIP/2.0\r\n\
            Via: SIP/2.0/UDP a.com;branch=z9hG4bK1, SIP/2.0/UDP b.com;branch=z9hG4bK2\r\n\
            CSeq: 2 BYE\r\n\
            Content-Length: 0\r\n\r\n";
        let msg = Parser::new(src).parse_sip_msg().unwrap();

        let stack: Vec<_> = msg.headers().vias().collect();
        assert_eq!(stack.len(), 2);
        assert_eq!(stack[0].branch().unwrap(), "z9hG4bK1");
        assert_eq!(stack[1].branch().unwrap(), "z9hG4bK2");
    }

    #[test]
    fn test_unknown_header_kept_verbatim() {
        let src = b"OPTIONS sip:host SIP/2.0\r\n\
            Subject: I know you're there\r\n\
            CSeq: 1 OPTIONS\r\n\
            Content-Length: 0\r\n\r\n";
        let msg = Parser::new(src).parse_sip_msg().unwrap();

        assert_eq!(msg.headers().get_other("subject"), Some("I know you're there"));
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let msg = Parser::new(REGISTER_MSG).parse_sip_msg().unwrap();
        let SipMsg::Request(request) = msg else {
            panic!("expected a request");
        };

        let encoded = format!("{}{}\r\n", request.req_line, request.headers);
        let reparsed = Parser::new(encoded.as_bytes()).parse_sip_msg().unwrap();
        let SipMsg::Request(reparsed) = reparsed else {
            panic!("expected a request");
        };
        assert_eq!(reparsed.req_line, request.req_line);
        assert_eq!(reparsed.headers, request.headers);
    }
}
