use asip_util::ArcStr;

use crate::error::{Error, Result, SipParserError};
use crate::message::SipMethod;
use crate::transport::{IncomingRequest, IncomingResponse, OutgoingRequest};

/// Transaction identity: the topmost Via branch plus the method.
///
/// ACK shares the branch of the INVITE it acknowledges and is keyed as
/// INVITE so it reaches the INVITE server transaction. CANCEL keeps its
/// own key; the dispatcher additionally probes the `(branch, INVITE)`
/// key to find the transaction being cancelled.
#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub struct TsxKey {
    branch: ArcStr,
    method: SipMethod,
}

impl TsxKey {
    /// Creates a key from a branch and method.
    pub fn new(branch: ArcStr, method: SipMethod) -> Self {
        let method = match method {
            SipMethod::Ack => SipMethod::Invite,
            method => method,
        };
        Self { branch, method }
    }

    /// The Via branch of the key.
    pub fn branch(&self) -> &ArcStr {
        &self.branch
    }

    /// The method of the key.
    pub fn method(&self) -> SipMethod {
        self.method
    }

    /// The key this CANCEL or ACK would target: `(branch, INVITE)`.
    pub fn as_invite(&self) -> TsxKey {
        TsxKey {
            branch: self.branch.clone(),
            method: SipMethod::Invite,
        }
    }

    /// Key of an outbound request, read from its topmost Via.
    pub fn from_outgoing(request: &OutgoingRequest) -> Result<Self> {
        let branch = request
            .branch()
            .cloned()
            .ok_or_else(|| Error::from(SipParserError::new("outbound request without branch")))?;

        Ok(Self::new(branch, request.method()))
    }

    /// Key of an inbound request.
    pub fn from_incoming(request: &IncomingRequest) -> Self {
        let branch = request
            .headers
            .via
            .branch()
            .cloned()
            .unwrap_or_else(|| request.headers.call_id.value().clone());

        Self::new(branch, request.headers.cseq.method)
    }

    /// Key a response is matched under: the branch it carries plus the
    /// CSeq method.
    pub fn from_response(response: &IncomingResponse) -> Option<Self> {
        let branch = response.headers.via.branch()?.clone();

        Some(Self::new(branch, response.cseq_method()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_keys_as_invite() {
        let key = TsxKey::new("z9hG4bKabc".into(), SipMethod::Ack);
        assert_eq!(key.method(), SipMethod::Invite);
    }

    #[test]
    fn test_cancel_keeps_own_key() {
        let key = TsxKey::new("z9hG4bKabc".into(), SipMethod::Cancel);
        assert_eq!(key.method(), SipMethod::Cancel);
        assert_eq!(key.as_invite().method(), SipMethod::Invite);
        assert_eq!(key.as_invite().branch(), key.branch());
    }
}
