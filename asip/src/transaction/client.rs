use std::cmp;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use futures_util::future::{self, Either};
use tokio::pin;
use tokio::sync::oneshot;
use tokio::time;

use super::{Role, State, TransactionCore, TransactionLayer, TsxKey, T1, T2, T4};
use crate::error::Result;
use crate::message::SipMethod;
use crate::transport::{IncomingResponse, OutgoingRequest};

type TxStopped = Arc<Mutex<Option<oneshot::Sender<()>>>>;
type RxStopped = oneshot::Receiver<()>;

/// A non-INVITE client transaction (RFC 3261 section 17.1.2).
///
/// Timer E drives retransmissions (doubling, capped at T2), timer F is
/// the 64*T1 overall deadline, timer K absorbs late responses after
/// completion.
#[derive(Clone)]
pub struct ClientTransaction {
    core: TransactionCore,
    tx_stopped: TxStopped,
}

impl ClientTransaction {
    /// Sends `request` and registers the new transaction.
    pub(crate) async fn send(
        mut request: OutgoingRequest,
        layer: &Arc<TransactionLayer>,
    ) -> Result<ClientTransaction> {
        let method = request.method();

        assert!(
            !matches!(method, SipMethod::Invite | SipMethod::Ack),
            "Invalid method for non-INVITE client transaction: {}",
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

        let (tx, rx) = oneshot::channel();
        let uac = Self {
            core,
            tx_stopped: Arc::new(Mutex::new(Some(tx))),
        };

        layer.add_client_tsx(uac.clone().into());

        uac.tsx_send_request(&mut request).await?;
        uac.change_state_to(State::Trying);

        tokio::spawn(uac.clone().retrans_loop(rx));

        Ok(uac)
    }

    async fn retrans_loop(self, mut rx_stopped: RxStopped) {
        let unreliable = !self.reliable();

        pin! {
            let timer_f = time::sleep(64 * T1);
            let timer_e = if unreliable {
                Either::Left(time::sleep(T1))
            } else {
                Either::Right(future::pending::<()>())
            };
        }

        'retrans: loop {
            tokio::select! {
                _ = &mut timer_e => {
                    let state = self.get_state();
                    match self.retransmit().await {
                        Ok(retrans) => {
                            let interval = if state == State::Trying {
                                cmp::min(T1 * (1 << retrans), T2)
                            } else {
                                T2
                            };
                            timer_e.set(Either::Left(time::sleep(interval)));
                        }
                        Err(err) => {
                            log::info!("Failed to retransmit: {}", err);
                        }
                    }
                }
                _ = &mut timer_f => {
                    // Timer F expired: report Timeout to the waiter.
                    self.on_terminated();
                    break 'retrans;
                }
                _ = &mut rx_stopped => {
                    // A final response arrived.
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
            State::Trying if code.is_provisional() => {
                self.change_state_to(State::Proceeding);
            }
            State::Trying | State::Proceeding if code.is_final() => {
                self.change_state_to(State::Completed);
                self.stop_timers();
                self.complete_with(response.response.clone());
                self.terminate();
            }
            State::Completed => {
                // A retransmitted final; already delivered upstream.
            }
            _ => (),
        }

        Ok(())
    }

    /// Enters Terminated, via timer K on unreliable transports.
    pub(crate) fn terminate(&self) {
        if self.reliable() {
            self.on_terminated();
        } else {
            // Timer K.
            self.schedule_termination(T4);
        }
    }
}

impl Deref for ClientTransaction {
    type Target = TransactionCore;

    fn deref(&self) -> &Self::Target {
        &self.core
    }
}
