use std::io;

use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use super::Payload;
use crate::headers::{ContentLength, SipHeaderParse};

/// Frame extractor for stream oriented transports.
///
/// Keeps a rolling buffer and cuts one message per `Content-Length`;
/// a message is complete once the header terminator and the announced
/// body length are both in the buffer.
#[derive(Default)]
pub(crate) struct StreamingDecoder;

impl Decoder for StreamingDecoder {
    type Error = io::Error;
    type Item = Payload;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Keep-alives may be interleaved between messages on a stream.
        while src.starts_with(b"\r\n") {
            let skip = if src.starts_with(b"\r\n\r\n") { 4 } else { 2 };
            src.advance(skip);
        }
        if src.is_empty() {
            return Ok(None);
        }

        let Some(pos) = find_subslice(src, b"\n\r\n") else {
            return Ok(None);
        };
        let hdr_end = pos + 1;
        let body_start = pos + 3;

        let mut content_length = None;
        for line in src[..hdr_end].split(|&b| b == b'\n') {
            let mut split = line.splitn(2, |&c| c == b':');
            let Some(name) = split.next() else {
                continue;
            };
            let Ok(name) = std::str::from_utf8(name) else {
                continue;
            };
            if ContentLength::matches_name(name.trim()) {
                let Some(value) = split.next() else {
                    continue;
                };
                let Ok(value_str) = std::str::from_utf8(value) else {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "Invalid UTF-8 in Content-Length header",
                    ));
                };
                if let Ok(parsed_value) = value_str.trim().parse::<usize>() {
                    content_length = Some(parsed_value);
                }
            }
        }

        let Some(c_len) = content_length else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Content-Length not found",
            ));
        };

        let expected_msg_size = body_start + c_len;
        if src.len() < expected_msg_size {
            src.reserve(expected_msg_size - src.len());
            return Ok(None);
        }

        let frame = src.split_to(expected_msg_size).freeze();
        Ok(Some(Payload::new(frame)))
    }
}

fn find_subslice(src: &[u8], needle: &[u8]) -> Option<usize> {
    src.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSG: &[u8] = b"OPTIONS sip:host SIP/2.0\r\nCSeq: 1 OPTIONS\r\nContent-Length: 4\r\n\r\nbody";

    #[test]
    fn test_whole_message() {
        let mut decoder = StreamingDecoder;
        let mut buf = BytesMut::from(MSG);

        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.buf(), MSG);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_message_waits() {
        let mut decoder = StreamingDecoder;

        // Header not complete yet.
        let mut buf = BytesMut::from(&MSG[..20]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        // Header complete, body still short.
        let mut buf = BytesMut::from(&MSG[..MSG.len() - 2]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_two_messages_in_one_read() {
        let mut decoder = StreamingDecoder;
        let mut joined = BytesMut::from(MSG);
        joined.extend_from_slice(MSG);

        let first = decoder.decode(&mut joined).unwrap().unwrap();
        let second = decoder.decode(&mut joined).unwrap().unwrap();

        assert_eq!(first.buf(), MSG);
        assert_eq!(second.buf(), MSG);
        assert!(joined.is_empty());
    }

    #[test]
    fn test_keepalive_is_skipped() {
        let mut decoder = StreamingDecoder;
        let mut buf = BytesMut::from(&b"\r\n\r\n"[..]);
        buf.extend_from_slice(MSG);

        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.buf(), MSG);
    }

    #[test]
    fn test_missing_content_length_is_error() {
        let mut decoder = StreamingDecoder;
        let mut buf = BytesMut::from(&b"OPTIONS sip:host SIP/2.0\r\nCSeq: 1 OPTIONS\r\n\r\n"[..]);

        assert!(decoder.decode(&mut buf).is_err());
    }
}
