use std::cmp;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use futures_util::future::{self, Either};
use tokio::pin;
use tokio::sync::oneshot;
use tokio::time;

use super::{Role, State, TransactionCore, TransactionLayer, TsxKey, T1, T2, TIMER_D};
use crate::error::Result;
use crate::headers::{self, CSeq, Header, Headers};
use crate::message::{Request, RequestLine, SipMethod, Uri};
use crate::transport::{IncomingResponse, OutgoingRequest};

type TxStopped = Arc<Mutex<Option<oneshot::Sender<()>>>>;
type RxStopped = oneshot::Receiver<()>;

/// The parts of the INVITE needed to build the ACK for a non-2xx final.
struct OriginalRequest {
    uri: Uri,
    via: headers::Via,
    from: headers::From,
    cseq: CSeq,
    call_id: headers::CallId,
}

/// An INVITE client transaction (RFC 3261 section 17.1.1).
///
/// Timer A drives request retransmissions, timer B is the 64*T1
/// deadline. A 2xx terminates the transaction at once; its ACK is the
/// dialog layer's job. Non-2xx finals are ACKed here with the INVITE's
/// branch and absorbed for timer D.
#[derive(Clone)]
pub struct InvClientTransaction {
    core: TransactionCore,
    request: Arc<OriginalRequest>,
    tx_stopped: TxStopped,
}

impl InvClientTransaction {
    /// Sends `request` and registers the new transaction. The dialog,
    /// when given, is attached before the first send so no provisional
    /// can slip past it.
    pub(crate) async fn send(
        mut request: OutgoingRequest,
        layer: &Arc<TransactionLayer>,
        dialog: Option<crate::dialog::Dialog>,
    ) -> Result<InvClientTransaction> {
        let method = request.method();

        assert!(
            matches!(method, SipMethod::Invite),
            "Invalid method for INVITE client transaction: {}",
            method
        );

        let key = TsxKey::from_outgoing(&request)?;
        let core = TransactionCore::new(
            Role::Uac,
            key,
            layer,
            request.transport.clone(),
            request.addr,
            State::Initial,
        );

        let via = request.msg.headers.top_via().cloned();
        let from = request.msg.headers.from_hdr().cloned();
        let call_id = request.msg.headers.call_id().cloned();
        let cseq = request.msg.headers.cseq().copied();

        let original = OriginalRequest {
            uri: request.msg.req_line.uri.clone(),
            via: via.expect("INVITE carries a Via"),
            from: from.expect("INVITE carries a From"),
            call_id: call_id.expect("INVITE carries a Call-ID"),
            cseq: cseq.expect("INVITE carries a CSeq"),
        };

        let (tx, rx) = oneshot::channel();
        let uac_inv = Self {
            core,
            request: Arc::new(original),
            tx_stopped: Arc::new(Mutex::new(Some(tx))),
        };

        if let Some(dialog) = dialog {
            uac_inv.set_dialog(dialog);
        }

        layer.add_client_tsx(uac_inv.clone().into());

        uac_inv.tsx_send_request(&mut request).await?;
        uac_inv.change_state_to(State::Calling);

        tokio::spawn(uac_inv.clone().retrans_loop(rx));

        Ok(uac_inv)
    }

    async fn retrans_loop(self, mut rx_stopped: RxStopped) {
        let unreliable = !self.reliable();

        pin! {
            let timer_b = time::sleep(64 * T1);
            let timer_a = if unreliable {
                Either::Left(time::sleep(T1))
            } else {
                Either::Right(future::pending::<()>())
            };
        }

        'retrans: loop {
            tokio::select! {
                _ = &mut timer_a, if self.is_calling() => {
                    match self.retransmit().await {
                        Ok(retrans) => {
                            let interval = cmp::min(T1 * (1 << retrans), T2);
                            timer_a.set(Either::Left(time::sleep(interval)));
                        }
                        Err(err) => {
                            log::info!("Failed to retransmit: {}", err);
                        }
                    }
                }
                _ = &mut timer_b, if self.is_calling() => {
                    // Timer B expired: report Timeout to the waiter.
                    self.on_terminated();
                    break 'retrans;
                }
                _ = &mut rx_stopped => {
                    break 'retrans;
                }
            }
        }
    }

    fn stop_timers(&self) {
        if let Some(tx) = self.tx_stopped.lock().expect("Lock failed").take() {
            let _ = tx.send(());
        }
    }

    pub(crate) async fn receive(&self, response: &IncomingResponse) -> Result<()> {
        let code = response.code();
        self.set_last_status_code(code);

        match self.get_state() {
            State::Calling if code.is_provisional() => {
                self.change_state_to(State::Proceeding);
                if let Some(dialog) = self.dialog() {
                    dialog.on_provisional(code);
                }
            }
            State::Proceeding if code.is_provisional() => {
                if let Some(dialog) = self.dialog() {
                    dialog.on_provisional(code);
                }
            }
            State::Calling | State::Proceeding if code.is_success() => {
                // 17.1.1.3: the 2xx may carry a new to-tag; its ACK is
                // generated by the dialog layer, not here.
                self.stop_timers();
                self.complete_with(response.response.clone());
                self.on_terminated();
            }
            State::Calling | State::Proceeding => {
                self.change_state_to(State::Completed);
                self.stop_timers();

                let mut ack = self.create_ack(response);
                self.tsx_send_request(&mut ack).await?;

                self.complete_with(response.response.clone());
                self.terminate();
            }
            State::Completed => {
                // 17.1.1.2: retransmitted finals re-trigger the ACK but
                // are not passed up.
                self.retransmit().await?;
            }
            _ => (),
        }

        Ok(())
    }

    /// Builds the ACK for a non-2xx final: same branch, same CSeq
    /// number, To taken from the response.
    fn create_ack(&self, response: &IncomingResponse) -> OutgoingRequest {
        let to = response
            .response
            .headers
            .to_hdr()
            .cloned()
            .unwrap_or_else(|| response.headers.to.clone());

        let cseq = CSeq {
            method: SipMethod::Ack,
            ..self.request.cseq
        };

        let headers = Headers::from([
            Header::Via(self.request.via.clone()),
            Header::From(self.request.from.clone()),
            Header::To(to),
            Header::CallId(self.request.call_id.clone()),
            Header::CSeq(cseq),
        ]);

        OutgoingRequest {
            msg: Request {
                req_line: RequestLine {
                    method: SipMethod::Ack,
                    uri: self.request.uri.clone(),
                },
                headers,
                body: None,
            },
            addr: self.addr(),
            transport: self.transport().clone(),
            buf: None,
        }
    }

    /// Enters Terminated, via timer D on unreliable transports.
    pub(crate) fn terminate(&self) {
        if self.reliable() {
            self.on_terminated();
        } else {
            // Timer D.
            self.schedule_termination(TIMER_D);
        }
    }
}

impl Deref for InvClientTransaction {
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
    use tokio::time::Duration;

    async fn send_invite() -> (Arc<TransactionLayer>, InvClientTransaction) {
        let layer = Arc::new(TransactionLayer::default());
        let request = mock::outgoing_request(SipMethod::Invite);
        let uac_inv = InvClientTransaction::send(request, &layer, None).await.unwrap();
        (layer, uac_inv)
    }

    #[tokio::test]
    async fn test_state_calling() {
        let (_layer, uac_inv) = send_invite().await;
        assert_eq!(uac_inv.get_state(), State::Calling);
    }

    #[tokio::test]
    async fn test_state_proceeding() {
        let (_layer, uac_inv) = send_invite().await;

        let ringing = mock::incoming_response(StatusCode::Ringing, SipMethod::Invite);
        uac_inv.receive(&ringing).await.unwrap();

        assert_eq!(uac_inv.get_state(), State::Proceeding);
    }

    #[tokio::test]
    async fn test_2xx_terminates_immediately() {
        let (layer, uac_inv) = send_invite().await;
        let key = uac_inv.key().clone();

        let ok = mock::incoming_response(StatusCode::Ok, SipMethod::Invite);
        uac_inv.receive(&ok).await.unwrap();

        assert_eq!(uac_inv.get_state(), State::Terminated);
        assert!(layer.find_client_tsx(&key).is_none());

        let response = uac_inv.completed().await.unwrap();
        assert_eq!(response.code(), StatusCode::Ok);
    }

    #[tokio::test]
    async fn test_error_final_enters_completed() {
        let (_layer, uac_inv) = send_invite().await;

        let busy = mock::incoming_response(StatusCode::BusyHere, SipMethod::Invite);
        uac_inv.receive(&busy).await.unwrap();

        assert_eq!(uac_inv.get_state(), State::Completed);
        assert_eq!(uac_inv.last_status_code(), Some(StatusCode::BusyHere));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_a_backoff() {
        let (_layer, uac_inv) = send_invite().await;

        assert_eq!(uac_inv.retrans_count(), 0);

        time::sleep(Duration::from_millis(500 + 1)).await;
        assert_eq!(uac_inv.retrans_count(), 1);

        time::sleep(Duration::from_secs(1) + Duration::from_millis(1)).await;
        assert_eq!(uac_inv.retrans_count(), 2);

        time::sleep(Duration::from_secs(2) + Duration::from_millis(1)).await;
        assert_eq!(uac_inv.retrans_count(), 3);

        time::sleep(Duration::from_secs(4) + Duration::from_millis(1)).await;
        assert_eq!(uac_inv.retrans_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_b_times_out() {
        let (_layer, uac_inv) = send_invite().await;

        time::sleep(64 * T1 + Duration::from_millis(1)).await;

        assert_eq!(uac_inv.get_state(), State::Terminated);
        assert_matches!(uac_inv.completed().await, Err(crate::Error::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_d_after_error_final() {
        let (_layer, uac_inv) = send_invite().await;

        let busy = mock::incoming_response(StatusCode::BusyHere, SipMethod::Invite);
        uac_inv.receive(&busy).await.unwrap();
        assert_eq!(uac_inv.get_state(), State::Completed);

        time::sleep(TIMER_D + Duration::from_millis(1)).await;
        assert_eq!(uac_inv.get_state(), State::Terminated);
    }
}
