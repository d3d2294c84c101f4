use std::cmp;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use futures_util::future::{self, Either};
use tokio::pin;
use tokio::sync::oneshot;
use tokio::time;

use super::{Role, State, TransactionCore, TransactionLayer, TsxKey, T1, T2, T4, TRYING_DELAY};
use crate::error::Result;
use crate::message::{SipMethod, StatusCode};
use crate::transport::{IncomingRequest, OutgoingResponse};

type TxConfirmed = Arc<Mutex<Option<oneshot::Sender<()>>>>;
type RxConfirmed = oneshot::Receiver<()>;

/// An INVITE server transaction (RFC 3261 section 17.2.1).
///
/// Answers `100 Trying` on its own when the TU stays silent, retransmits
/// non-2xx finals on timer G until the ACK arrives or timer H gives up,
/// and absorbs ACK retransmissions during timer I.
#[derive(Clone)]
pub struct InvServerTransaction {
    core: TransactionCore,
    request: Arc<IncomingRequest>,
    tx_confirmed: TxConfirmed,
}

impl InvServerTransaction {
    /// Creates the transaction for an inbound INVITE and attaches it to
    /// the request.
    pub(crate) fn new(request: &mut IncomingRequest, layer: &Arc<TransactionLayer>) -> Self {
        let method = request.method();

        assert!(
            matches!(method, SipMethod::Invite),
            "Invalid method for INVITE server transaction: {}",
            method
        );

        let core = TransactionCore::new(
            Role::Uas,
            TsxKey::from_incoming(request),
            layer,
            request.transport.clone(),
            request.packet.addr,
            State::Proceeding,
        );

        let uas_inv = Self {
            core,
            request: Arc::new(request.clone()),
            tx_confirmed: Default::default(),
        };

        layer.add_server_tsx(uas_inv.clone().into());
        request.set_transaction(uas_inv.clone().into());

        // 17.2.1: answer 100 Trying if the TU has not responded within
        // 200ms.
        tokio::spawn(uas_inv.clone().auto_trying());

        uas_inv
    }

    async fn auto_trying(self) {
        time::sleep(TRYING_DELAY).await;

        if self.last_status_code().is_none() && self.get_state() == State::Proceeding {
            let mut trying = self.request.new_response(StatusCode::Trying);
            if let Err(err) = self.respond(&mut trying).await {
                log::debug!("Failed to send 100 Trying: {}", err);
            }
        }
    }

    /// Sends a response through the transaction and advances the state
    /// machine.
    pub async fn respond(&self, response: &mut OutgoingResponse) -> Result<()> {
        self.tsx_send_response(response).await?;

        match response.status_code().as_u16() {
            100..=199 => {
                self.change_state_to(State::Proceeding);
            }
            200..=299 => {
                // The 2xx and its retransmissions belong to the TU; the
                // transaction ends here.
                self.on_terminated();
            }
            300..=699 => {
                self.change_state_to(State::Completed);

                let (tx, rx) = oneshot::channel();
                self.tx_confirmed.lock().expect("Lock failed").replace(tx);
                self.retrans_loop(rx);
            }
            _ => (),
        }

        Ok(())
    }

    /// Answers the INVITE with `487 Request Terminated` after a matching
    /// CANCEL. Returns `false` when a final response was already sent.
    pub(crate) async fn cancelled(&self) -> Result<bool> {
        if self.get_state() != State::Proceeding {
            return Ok(false);
        }

        let mut terminated = self.request.new_response(StatusCode::RequestTerminated);
        self.respond(&mut terminated).await?;

        if let Some(dialog) = self.dialog() {
            dialog.on_remote_cancel();
        }

        Ok(true)
    }

    fn retrans_loop(&self, mut rx_confirmed: RxConfirmed) {
        let unreliable = !self.reliable();
        let uas_inv = self.clone();

        tokio::spawn(async move {
            pin! {
                let timer_h = time::sleep(64 * T1);
                let timer_g = if unreliable {
                    Either::Left(time::sleep(T1))
                } else {
                    Either::Right(future::pending::<()>())
                };
            }

            'retrans: loop {
                tokio::select! {
                    _ = &mut timer_g => {
                        match uas_inv.retransmit().await {
                            Ok(retrans) => {
                                let interval = cmp::min(T1 * (1 << retrans), T2);
                                timer_g.set(Either::Left(time::sleep(interval)));
                            }
                            Err(err) => {
                                log::info!("Failed to retransmit: {}", err);
                            }
                        }
                    }
                    _ = &mut timer_h => {
                        // No ACK ever arrived.
                        uas_inv.on_terminated();
                        break 'retrans;
                    }
                    _ = &mut rx_confirmed => {
                        break 'retrans;
                    }
                }
            }
        });
    }

    pub(crate) async fn receive_request(&self, request: &IncomingRequest) -> Result<()> {
        match (request.method(), self.get_state()) {
            (SipMethod::Ack, State::Completed) => {
                self.change_state_to(State::Confirmed);
                if let Some(tx) = self.tx_confirmed.lock().expect("Lock failed").take() {
                    let _ = tx.send(());
                }
                self.terminate();
            }
            (SipMethod::Ack, State::Confirmed) => {
                // Absorbed silently.
            }
            (SipMethod::Invite, State::Proceeding | State::Completed) => {
                self.retransmit().await?;
            }
            _ => (),
        }

        Ok(())
    }

    /// Enters Terminated, via timer I on unreliable transports.
    pub(crate) fn terminate(&self) {
        if self.reliable() {
            self.on_terminated();
        } else {
            // Timer I.
            self.core.schedule_termination(T4);
        }
    }
}

impl Deref for InvServerTransaction {
    type Target = TransactionCore;

    fn deref(&self) -> &Self::Target {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::mock;
    use tokio::time::Duration;

    fn uas_inv() -> (Arc<TransactionLayer>, InvServerTransaction) {
        let layer = Arc::new(TransactionLayer::default());
        let mut request = mock::request(SipMethod::Invite);
        let tsx = InvServerTransaction::new(&mut request, &layer);
        (layer, tsx)
    }

    #[tokio::test]
    async fn test_provisional_keeps_proceeding() {
        let (_layer, tsx) = uas_inv();

        let response = &mut mock::response(StatusCode::Ringing, SipMethod::Invite);
        tsx.respond(response).await.unwrap();

        assert_eq!(tsx.last_status_code(), Some(StatusCode::Ringing));
        assert_eq!(tsx.get_state(), State::Proceeding);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_100_trying() {
        let (_layer, tsx) = uas_inv();
        assert!(tsx.last_status_code().is_none());

        time::sleep(TRYING_DELAY + Duration::from_millis(1)).await;

        assert_eq!(tsx.last_status_code(), Some(StatusCode::Trying));
        assert_eq!(tsx.get_state(), State::Proceeding);
    }

    #[tokio::test]
    async fn test_2xx_terminates() {
        let (layer, tsx) = uas_inv();
        let key = tsx.key().clone();

        let response = &mut mock::response(StatusCode::Ok, SipMethod::Invite);
        tsx.respond(response).await.unwrap();

        assert_eq!(tsx.get_state(), State::Terminated);
        assert!(layer.find_server_tsx(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_g_retransmits_final() {
        let (_layer, tsx) = uas_inv();

        let response = &mut mock::response(StatusCode::BusyHere, SipMethod::Invite);
        tsx.respond(response).await.unwrap();

        time::sleep(T1 + Duration::from_millis(1)).await;
        assert_eq!(tsx.retrans_count(), 1);

        time::sleep(T1 * 2 + Duration::from_millis(1)).await;
        assert_eq!(tsx.retrans_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_confirms_and_timer_i_terminates() {
        let (_layer, tsx) = uas_inv();

        let response = &mut mock::response(StatusCode::BusyHere, SipMethod::Invite);
        tsx.respond(response).await.unwrap();
        assert_eq!(tsx.get_state(), State::Completed);

        let ack = mock::request(SipMethod::Ack);
        tsx.receive_request(&ack).await.unwrap();
        assert_eq!(tsx.get_state(), State::Confirmed);

        time::sleep(T4 + Duration::from_millis(1)).await;
        assert_eq!(tsx.get_state(), State::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_h_gives_up_without_ack() {
        let (_layer, tsx) = uas_inv();

        let response = &mut mock::response(StatusCode::BusyHere, SipMethod::Invite);
        tsx.respond(response).await.unwrap();

        time::sleep(64 * T1 + Duration::from_millis(1)).await;
        assert_eq!(tsx.get_state(), State::Terminated);
    }

    #[tokio::test]
    async fn test_cancel_in_proceeding_sends_487() {
        let (_layer, tsx) = uas_inv();

        assert!(tsx.cancelled().await.unwrap());
        assert_eq!(tsx.last_status_code(), Some(StatusCode::RequestTerminated));
        assert_eq!(tsx.get_state(), State::Completed);

        // A second CANCEL is a no-op.
        assert!(!tsx.cancelled().await.unwrap());
    }
}
