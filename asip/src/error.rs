use std::fmt;
use std::str::Utf8Error;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error produced while parsing a SIP message or header.
#[derive(Debug, PartialEq, Eq, Error)]
pub struct SipParserError {
    /// Message in error.
    pub message: String,
}

impl fmt::Display for SipParserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl SipParserError {
    pub fn new<T>(s: T) -> Self
    where
        T: AsRef<str>,
    {
        Self {
            message: s.as_ref().to_string(),
        }
    }
}

impl From<&str> for SipParserError {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SipParserError {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<Utf8Error> for SipParserError {
    fn from(value: Utf8Error) -> Self {
        SipParserError {
            message: format!("invalid utf-8: {}", value),
        }
    }
}

impl From<asip_util::ScanError> for SipParserError {
    fn from(err: asip_util::ScanError) -> Self {
        SipParserError {
            message: format!("failed to parse at byte {} kind:{:?}", err.offset, err.kind),
        }
    }
}

/// The error type used throughout the library.
#[derive(Debug, Error)]
pub enum Error {
    /// The wire bytes did not form a valid SIP message.
    #[error(transparent)]
    Parse(#[from] SipParserError),

    /// A mandatory header was missing from an inbound message.
    #[error("Missing required '{0}' header")]
    MissingRequiredHeader(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An internal channel was closed while a message was in flight.
    #[error("Channel closed")]
    ChannelClosed,

    /// A transaction timer (B, F or H) or a user supplied timeout expired.
    #[error("Request timed out")]
    Timeout,

    /// The request or dialog was cancelled by the caller.
    #[error("Cancelled")]
    Cancelled,

    /// The transport carrying the dialog or transaction was lost.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The authentication retry budget was exhausted, or no password was
    /// configured for a challenge.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(&'static str),

    /// The dialog was already closed.
    #[error("Dialog closed")]
    DialogClosed,

    #[error("Fmt error")]
    Fmt(#[from] std::fmt::Error),
}

impl From<asip_util::ScanError> for Error {
    fn from(err: asip_util::ScanError) -> Self {
        Error::Parse(err.into())
    }
}

impl From<Utf8Error> for Error {
    fn from(err: Utf8Error) -> Self {
        Error::Parse(err.into())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::ChannelClosed
    }
}
