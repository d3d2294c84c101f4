use std::ops::Deref;
use std::sync::Arc;

use super::{Role, State, TransactionCore, TransactionLayer, TsxKey, T1};
use crate::error::Result;
use crate::message::SipMethod;
use crate::transport::{IncomingRequest, OutgoingResponse};

/// A non-INVITE server transaction (RFC 3261 section 17.2.2).
///
/// Caches the latest response and re-sends it for retransmitted
/// requests; timer J (64*T1 on UDP, zero on reliable transports)
/// absorbs stragglers after the final.
#[derive(Clone)]
pub struct ServerTransaction {
    core: TransactionCore,
}

impl ServerTransaction {
    /// Creates the transaction for an inbound request and attaches it to
    /// the request.
    pub(crate) fn new(request: &mut IncomingRequest, layer: &Arc<TransactionLayer>) -> Self {
        let method = request.method();

        assert!(
            !matches!(method, SipMethod::Invite | SipMethod::Ack),
            "Invalid method for non-INVITE server transaction: {}",
            method
        );

        let core = TransactionCore::new(
            Role::Uas,
            TsxKey::from_incoming(request),
            layer,
            request.transport.clone(),
            request.packet.addr,
            State::Trying,
        );

        let uas = Self { core };

        layer.add_server_tsx(uas.clone().into());
        request.set_transaction(uas.clone().into());

        uas
    }

    /// Sends a response through the transaction and advances the state
    /// machine.
    pub async fn respond(&self, response: &mut OutgoingResponse) -> Result<()> {
        self.tsx_send_response(response).await?;

        if response.is_provisional() {
            self.change_state_to(State::Proceeding);
        } else {
            self.change_state_to(State::Completed);
            self.terminate();
        }

        Ok(())
    }

    pub(crate) async fn receive_request(&self, _request: &IncomingRequest) -> Result<()> {
        // A retransmitted request; re-send the latest response if one
        // went out already.
        if matches!(self.get_state(), State::Proceeding | State::Completed) {
            self.retransmit().await?;
        }
        Ok(())
    }

    /// Enters Terminated, via timer J on unreliable transports.
    pub(crate) fn terminate(&self) {
        if self.reliable() {
            self.on_terminated();
        } else {
            // Timer J.
            self.core.schedule_termination(64 * T1);
        }
    }
}

impl Deref for ServerTransaction {
    type Target = TransactionCore;

    fn deref(&self) -> &Self::Target {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StatusCode;
    use crate::transaction::mock;
    use tokio::time::{self, Duration};

    fn uas() -> (Arc<TransactionLayer>, ServerTransaction) {
        let layer = Arc::new(TransactionLayer::default());
        let mut request = mock::request(SipMethod::Register);
        let tsx = ServerTransaction::new(&mut request, &layer);
        (layer, tsx)
    }

    #[tokio::test]
    async fn test_trying_then_proceeding() {
        let (_layer, tsx) = uas();
        assert_eq!(tsx.get_state(), State::Trying);

        let response = &mut mock::response(StatusCode::Trying, SipMethod::Register);
        tsx.respond(response).await.unwrap();

        assert_eq!(tsx.get_state(), State::Proceeding);
        assert_eq!(tsx.last_status_code(), Some(StatusCode::Trying));
    }

    #[tokio::test]
    async fn test_final_enters_completed() {
        let (_layer, tsx) = uas();

        let response = &mut mock::response(StatusCode::Ok, SipMethod::Register);
        tsx.respond(response).await.unwrap();

        assert_eq!(tsx.get_state(), State::Completed);
    }

    #[tokio::test]
    async fn test_retransmitted_request_resends_response() {
        let (_layer, tsx) = uas();

        let response = &mut mock::response(StatusCode::Ok, SipMethod::Register);
        tsx.respond(response).await.unwrap();
        assert_eq!(tsx.retrans_count(), 0);

        let retransmission = mock::request(SipMethod::Register);
        tsx.receive_request(&retransmission).await.unwrap();
        assert_eq!(tsx.retrans_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_j_terminates() {
        let (layer, tsx) = uas();
        let key = tsx.key().clone();

        let response = &mut mock::response(StatusCode::Ok, SipMethod::Register);
        tsx.respond(response).await.unwrap();

        time::sleep(64 * T1 + Duration::from_millis(1)).await;

        assert_eq!(tsx.get_state(), State::Terminated);
        assert!(layer.find_server_tsx(&key).is_none());
    }
}
