#![deny(missing_docs)]
//! SIP Transaction Layer.
//!
//! Implements the four RFC 3261 transaction state machines with their
//! retransmission timers. The layer matches inbound messages to live
//! transactions by `(branch, method)` and knows nothing about SIP
//! semantics beyond CSeq, method and status code classes.

use std::collections::HashMap;
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::dialog::Dialog;
use crate::error::{Error, Result};
use crate::message::{Response, StatusCode};
use crate::transport::{
    IncomingRequest, IncomingResponse, OutgoingRequest, OutgoingResponse, ToBytes, Transport,
};

pub(crate) mod client;
pub(crate) mod inv_client;
pub(crate) mod inv_server;
pub(crate) mod server;

mod key;

pub use client::ClientTransaction;
pub use inv_client::InvClientTransaction;
pub use inv_server::InvServerTransaction;
pub use key::TsxKey;
pub use server::ServerTransaction;

/// Estimated round-trip time; the baseline for retransmission intervals.
pub const T1: Duration = Duration::from_millis(500);

/// Maximum retransmission interval for non-INVITE requests and INVITE
/// responses.
pub const T2: Duration = Duration::from_secs(4);

/// Maximum time a message may stay in the network.
pub const T4: Duration = Duration::from_secs(5);

/// Wait time for response retransmissions after a non-2xx final
/// (INVITE client, unreliable transports).
pub(crate) const TIMER_D: Duration = Duration::from_secs(32);

/// How long the INVITE server transaction waits for the TU before
/// answering `100 Trying` on its own.
pub(crate) const TRYING_DELAY: Duration = Duration::from_millis(200);

/// The possible roles of a SIP transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The entity that initiates the request.
    Uac,
    /// The entity that responds to the request.
    Uas,
}

/// The possible states of a SIP transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    /// Before the first send or receive.
    #[default]
    Initial,
    /// INVITE client: request sent, no response yet.
    Calling,
    /// Non-INVITE: request sent or received, no final yet.
    Trying,
    /// A provisional response was seen.
    Proceeding,
    /// A final response was seen or sent.
    Completed,
    /// INVITE server: the ACK for a non-2xx final arrived.
    Confirmed,
    /// The transaction is dead and removed from the registry.
    Terminated,
}

type Completion = Mutex<Option<oneshot::Sender<Result<Response>>>>;

struct Inner {
    role: Role,
    key: TsxKey,
    layer: Weak<TransactionLayer>,
    transport: Arc<dyn Transport>,
    addr: SocketAddr,
    state: Mutex<State>,
    status_code: RwLock<Option<StatusCode>>,
    retransmit_count: AtomicUsize,
    last_msg: Mutex<Option<Bytes>>,
    completion: Completion,
    completion_rx: Mutex<Option<oneshot::Receiver<Result<Response>>>>,
    dialog: RwLock<Option<Dialog>>,
}

/// State shared by all four transaction kinds.
#[derive(Clone)]
pub struct TransactionCore(Arc<Inner>);

impl TransactionCore {
    pub(crate) fn new(
        role: Role,
        key: TsxKey,
        layer: &Arc<TransactionLayer>,
        transport: Arc<dyn Transport>,
        addr: SocketAddr,
        state: State,
    ) -> Self {
        let (tx, rx) = oneshot::channel();

        let core = Self(Arc::new(Inner {
            role,
            key,
            layer: Arc::downgrade(layer),
            transport,
            addr,
            state: Mutex::new(state),
            status_code: RwLock::new(None),
            retransmit_count: AtomicUsize::new(0),
            last_msg: Mutex::new(None),
            completion: Mutex::new(Some(tx)),
            completion_rx: Mutex::new(Some(rx)),
            dialog: RwLock::new(None),
        }));

        log::trace!("Transaction created [{:?}] {:?}", core.0.role, core.0.key);

        core
    }

    /// The key identifying this transaction.
    pub fn key(&self) -> &TsxKey {
        &self.0.key
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.0.transport
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.0.addr
    }

    /// `true` when the transport retransmits on its own.
    #[inline]
    pub fn reliable(&self) -> bool {
        self.0.transport.reliable()
    }

    /// The current state of the transaction.
    #[inline]
    pub fn get_state(&self) -> State {
        *self.0.state.lock().expect("Lock failed")
    }

    pub(crate) fn change_state_to(&self, state: State) {
        let old = {
            let mut guard = self.0.state.lock().expect("Lock failed");
            mem::replace(&mut *guard, state)
        };
        log::trace!("State changed [{old:?} -> {state:?}] {:?}", self.0.key);
    }

    pub(crate) fn is_calling(&self) -> bool {
        self.get_state() == State::Calling
    }

    /// Number of retransmissions performed so far.
    #[inline]
    pub fn retrans_count(&self) -> u32 {
        self.0.retransmit_count.load(Ordering::SeqCst) as u32
    }

    #[inline]
    fn add_retrans_count(&self) -> u32 {
        self.0.retransmit_count.fetch_add(1, Ordering::SeqCst) as u32 + 1
    }

    /// The last status code sent or received.
    #[inline]
    pub fn last_status_code(&self) -> Option<StatusCode> {
        *self.0.status_code.read().expect("Lock failed")
    }

    #[inline]
    pub(crate) fn set_last_status_code(&self, code: StatusCode) {
        *self.0.status_code.write().expect("Lock failed") = Some(code);
    }

    pub(crate) fn set_last_msg(&self, msg: Bytes) {
        *self.0.last_msg.lock().expect("Lock failed") = Some(msg);
    }

    pub(crate) fn set_dialog(&self, dialog: Dialog) {
        *self.0.dialog.write().expect("Lock failed") = Some(dialog);
    }

    pub(crate) fn dialog(&self) -> Option<Dialog> {
        self.0.dialog.read().expect("Lock failed").clone()
    }

    /// Awaits the final outcome of a client transaction: the final
    /// response, or `Timeout`/`Cancelled`/`ConnectionClosed`.
    ///
    /// May be called once; later calls fail with `ChannelClosed`.
    pub async fn completed(&self) -> Result<Response> {
        let rx = self.0.completion_rx.lock().expect("Lock failed").take();
        let Some(rx) = rx else {
            return Err(Error::ChannelClosed);
        };

        rx.await.map_err(|_| Error::ChannelClosed)?
    }

    pub(crate) fn complete_with(&self, response: Response) {
        if let Some(tx) = self.0.completion.lock().expect("Lock failed").take() {
            let _ = tx.send(Ok(response));
        }
    }

    pub(crate) fn fail(&self, err: Error) {
        if let Some(tx) = self.0.completion.lock().expect("Lock failed").take() {
            let _ = tx.send(Err(err));
        }
    }

    /// Re-sends the last message written by this transaction.
    pub(crate) async fn retransmit(&self) -> Result<u32> {
        let msg = self.0.last_msg.lock().expect("Lock failed").clone();

        match msg {
            Some(msg) => {
                self.0.transport.send(&msg, &self.0.addr).await?;
                Ok(self.add_retrans_count())
            }
            None => Err(Error::Io(std::io::Error::other("No message to retransmit"))),
        }
    }

    pub(crate) async fn tsx_send_request(&self, msg: &mut OutgoingRequest) -> Result<()> {
        log::debug!("=> Request {} to /{}", msg.msg.req_line.method, msg.addr);
        let buf = match msg.buf.take() {
            Some(buf) => buf,
            None => msg.to_bytes()?,
        };
        self.0.transport.send(&buf, &self.0.addr).await?;
        self.set_last_msg(buf);
        Ok(())
    }

    pub(crate) async fn tsx_send_response(&self, msg: &mut OutgoingResponse) -> Result<()> {
        let code = msg.status_code();
        log::debug!("=> Response {} {}", code.as_u16(), msg.reason());
        let buf = match msg.buf.take() {
            Some(buf) => buf,
            None => msg.to_bytes()?,
        };
        self.0.transport.send(&buf, &self.0.addr).await?;
        self.set_last_status_code(code);
        self.set_last_msg(buf);
        Ok(())
    }

    /// Marks the transaction Terminated and removes it from the
    /// registry. A leftover waiter sees `Timeout`.
    pub(crate) fn on_terminated(&self) {
        self.change_state_to(State::Terminated);
        self.fail(Error::Timeout);

        if let Some(layer) = self.0.layer.upgrade() {
            match self.0.role {
                Role::Uac => { layer.remove_client_tsx(&self.0.key); }
                Role::Uas => { layer.remove_server_tsx(&self.0.key); }
            };
        }
    }

    pub(crate) fn schedule_termination(&self, delay: Duration) {
        let tsx = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tsx.on_terminated();
        });
    }
}

/// A client transaction, either INVITE or non-INVITE.
#[derive(Clone)]
pub enum ClientTsx {
    /// A non-INVITE client transaction.
    NonInvite(ClientTransaction),
    /// An INVITE client transaction.
    Invite(InvClientTransaction),
}

impl ClientTsx {
    /// The key identifying this transaction.
    pub fn key(&self) -> &TsxKey {
        match self {
            ClientTsx::NonInvite(uac) => uac.key(),
            ClientTsx::Invite(uac_inv) => uac_inv.key(),
        }
    }

    /// The shared transaction core.
    pub fn core(&self) -> &TransactionCore {
        match self {
            ClientTsx::NonInvite(uac) => uac,
            ClientTsx::Invite(uac_inv) => uac_inv,
        }
    }

    pub(crate) async fn receive(&self, response: &IncomingResponse) -> Result<()> {
        match self {
            ClientTsx::NonInvite(uac) => uac.receive(response).await,
            ClientTsx::Invite(uac_inv) => uac_inv.receive(response).await,
        }
    }

    /// Cancels the transaction from the caller side.
    pub fn cancel(&self) {
        self.core().fail(Error::Cancelled);
        self.core().on_terminated();
    }
}

impl From<ClientTransaction> for ClientTsx {
    fn from(tsx: ClientTransaction) -> Self {
        ClientTsx::NonInvite(tsx)
    }
}

impl From<InvClientTransaction> for ClientTsx {
    fn from(tsx: InvClientTransaction) -> Self {
        ClientTsx::Invite(tsx)
    }
}

/// A server transaction, either INVITE or non-INVITE.
#[derive(Clone)]
pub enum ServerTsx {
    /// A non-INVITE server transaction.
    NonInvite(ServerTransaction),
    /// An INVITE server transaction.
    Invite(InvServerTransaction),
}

impl ServerTsx {
    /// The key identifying this transaction.
    pub fn key(&self) -> &TsxKey {
        match self {
            ServerTsx::NonInvite(uas) => uas.key(),
            ServerTsx::Invite(uas_inv) => uas_inv.key(),
        }
    }

    /// The last status code sent by this transaction.
    pub fn last_status_code(&self) -> Option<StatusCode> {
        match self {
            ServerTsx::NonInvite(uas) => uas.last_status_code(),
            ServerTsx::Invite(uas_inv) => uas_inv.last_status_code(),
        }
    }

    /// Attaches a dialog to the transaction.
    pub fn set_dialog(&self, dialog: Dialog) {
        match self {
            ServerTsx::NonInvite(uas) => uas.set_dialog(dialog),
            ServerTsx::Invite(uas_inv) => uas_inv.set_dialog(dialog),
        }
    }

    /// Sends a response through this transaction.
    pub async fn respond(&self, response: &mut OutgoingResponse) -> Result<()> {
        match self {
            ServerTsx::NonInvite(uas) => uas.respond(response).await,
            ServerTsx::Invite(uas_inv) => uas_inv.respond(response).await,
        }
    }

    pub(crate) async fn receive_request(&self, request: &IncomingRequest) -> Result<()> {
        match self {
            ServerTsx::NonInvite(uas) => uas.receive_request(request).await,
            ServerTsx::Invite(uas_inv) => uas_inv.receive_request(request).await,
        }
    }
}

impl From<ServerTransaction> for ServerTsx {
    fn from(tsx: ServerTransaction) -> Self {
        ServerTsx::NonInvite(tsx)
    }
}

impl From<InvServerTransaction> for ServerTsx {
    fn from(tsx: InvServerTransaction) -> Self {
        ServerTsx::Invite(tsx)
    }
}

/// Registry of all live transactions.
#[derive(Default)]
pub struct TransactionLayer {
    client_transactions: Mutex<HashMap<TsxKey, ClientTsx>>,
    server_transactions: Mutex<HashMap<TsxKey, ServerTsx>>,
}

impl TransactionLayer {
    /// Removes a server transaction from the registry.
    #[inline]
    pub fn remove_server_tsx(&self, key: &TsxKey) -> Option<ServerTsx> {
        self.server_transactions.lock().expect("Lock failed").remove(key)
    }

    /// Removes a client transaction from the registry.
    #[inline]
    pub fn remove_client_tsx(&self, key: &TsxKey) -> Option<ClientTsx> {
        self.client_transactions.lock().expect("Lock failed").remove(key)
    }

    #[inline]
    pub(crate) fn add_client_tsx(&self, tsx: ClientTsx) {
        let key = tsx.key().clone();
        self.client_transactions.lock().expect("Lock failed").insert(key, tsx);
    }

    #[inline]
    pub(crate) fn add_server_tsx(&self, tsx: ServerTsx) {
        let key = tsx.key().clone();
        self.server_transactions.lock().expect("Lock failed").insert(key, tsx);
    }

    pub(crate) fn find_server_tsx(&self, key: &TsxKey) -> Option<ServerTsx> {
        self.server_transactions.lock().expect("Lock failed").get(key).cloned()
    }

    pub(crate) fn find_client_tsx(&self, key: &TsxKey) -> Option<ClientTsx> {
        self.client_transactions.lock().expect("Lock failed").get(key).cloned()
    }

    /// Fails every transaction bound to `peer` with `ConnectionClosed`.
    pub(crate) fn fail_peer(&self, peer: SocketAddr) {
        let clients: Vec<ClientTsx> = {
            let map = self.client_transactions.lock().expect("Lock failed");
            map.values().filter(|t| t.core().addr() == peer).cloned().collect()
        };
        for tsx in clients {
            tsx.core().fail(Error::ConnectionClosed);
            tsx.core().on_terminated();
        }

        let servers: Vec<ServerTsx> = {
            let map = self.server_transactions.lock().expect("Lock failed");
            map.values()
                .filter(|t| match t {
                    ServerTsx::NonInvite(tsx) => tsx.addr() == peer,
                    ServerTsx::Invite(tsx) => tsx.addr() == peer,
                })
                .cloned()
                .collect()
        };
        for tsx in servers {
            match tsx {
                ServerTsx::NonInvite(tsx) => tsx.on_terminated(),
                ServerTsx::Invite(tsx) => tsx.on_terminated(),
            }
        }
    }

    /// Routes an inbound response to its client transaction.
    ///
    /// Returns `true` when a transaction consumed the response.
    pub(crate) async fn handle_response(&self, response: &mut IncomingResponse) -> Result<bool> {
        let Some(key) = TsxKey::from_response(response) else {
            return Ok(false);
        };

        let Some(client_tsx) = self.find_client_tsx(&key) else {
            return Ok(false);
        };

        response.transaction = Some(client_tsx.clone());
        client_tsx.receive(response).await?;

        Ok(true)
    }

    /// Routes an inbound request to its server transaction
    /// (retransmissions and ACKs).
    ///
    /// Returns `true` when a transaction consumed the request.
    pub(crate) async fn handle_request(&self, request: &IncomingRequest) -> Result<bool> {
        let key = TsxKey::from_incoming(request);

        let Some(server_tsx) = self.find_server_tsx(&key) else {
            return Ok(false);
        };

        server_tsx.receive_request(request).await?;
        Ok(true)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::time::SystemTime;

    use crate::headers::{
        CSeq, CallId, From as FromHdr, Header, Headers, SipHeaderParse, To, Via,
    };
    use crate::message::{Request, Response, SipMethod, StatusCode, Uri};
    use crate::transport::udp::mock::MockUdpTransport;
    use crate::transport::{
        OutgoingAddr, Packet, Payload, RequestHeaders,
    };

    pub fn mandatory_headers(method: SipMethod) -> RequestHeaders {
        let from = FromHdr::from_bytes(b"<sip:alice@127.0.0.1:5060>;tag=9fxced76sl").unwrap();
        let to = To::from_bytes(b"<sip:bob@127.0.0.1:5060>").unwrap();
        let via = Via::from_bytes(
            b"SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK3060200;received=127.0.0.1",
        )
        .unwrap();

        RequestHeaders {
            via,
            from,
            to,
            call_id: CallId::new("bs9ki9iqbee8k5kal8mpqb"),
            cseq: CSeq::new(1, method),
        }
    }

    fn headers_of(mandatory: &RequestHeaders) -> Headers {
        Headers::from([
            Header::Via(mandatory.via.clone()),
            Header::From(mandatory.from.clone()),
            Header::To(mandatory.to.clone()),
            Header::CallId(mandatory.call_id.clone()),
            Header::CSeq(mandatory.cseq),
        ])
    }

    pub fn request(method: SipMethod) -> IncomingRequest {
        let headers = mandatory_headers(method);
        let transport: Arc<dyn Transport> = Arc::new(MockUdpTransport::new());

        let mut request = Request::new(method, Uri::from_static("sip:bob@127.0.0.1:5060").unwrap());
        request.headers = headers_of(&headers);

        IncomingRequest {
            request,
            packet: Packet {
                payload: Payload::new(Bytes::new()),
                addr: transport.addr(),
                time: SystemTime::now(),
            },
            transport,
            transaction: None,
            headers,
        }
    }

    pub fn outgoing_request(method: SipMethod) -> OutgoingRequest {
        let headers = mandatory_headers(method);
        let transport: Arc<dyn Transport> = Arc::new(MockUdpTransport::new());

        let mut msg = Request::new(method, Uri::from_static("sip:bob@127.0.0.1:5060").unwrap());
        msg.headers = headers_of(&headers);

        OutgoingRequest {
            msg,
            addr: transport.addr(),
            transport,
            buf: None,
        }
    }

    pub fn incoming_response(code: StatusCode, method: SipMethod) -> IncomingResponse {
        let headers = mandatory_headers(method);
        let transport: Arc<dyn Transport> = Arc::new(MockUdpTransport::new());

        let mut response = Response::new(code);
        response.headers = headers_of(&headers);

        IncomingResponse {
            response,
            packet: Packet {
                payload: Payload::new(Bytes::new()),
                addr: transport.addr(),
                time: SystemTime::now(),
            },
            transport,
            transaction: None,
            headers,
        }
    }

    pub fn response(code: StatusCode, method: SipMethod) -> OutgoingResponse {
        let headers = mandatory_headers(method);
        let transport: Arc<dyn Transport> = Arc::new(MockUdpTransport::new());

        let mut response = Response::new(code);
        response.headers = headers_of(&headers);

        OutgoingResponse {
            response,
            addr: OutgoingAddr::Addr {
                addr: transport.addr(),
                transport,
            },
            buf: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SipMethod;

    #[tokio::test]
    async fn test_server_registry_add_remove() {
        let layer = Arc::new(TransactionLayer::default());
        let mut request = mock::request(SipMethod::Register);

        let tsx = ServerTransaction::new(&mut request, &layer);
        let key = request.tsx_key().unwrap().clone();

        assert!(matches!(
            layer.find_server_tsx(&key),
            Some(ServerTsx::NonInvite(_))
        ));

        tsx.on_terminated();
        assert!(layer.find_server_tsx(&key).is_none());
    }

    #[tokio::test]
    async fn test_invite_server_registry_add_remove() {
        let layer = Arc::new(TransactionLayer::default());
        let mut request = mock::request(SipMethod::Invite);

        let tsx = InvServerTransaction::new(&mut request, &layer);
        let key = request.tsx_key().unwrap().clone();

        assert!(matches!(
            layer.find_server_tsx(&key),
            Some(ServerTsx::Invite(_))
        ));

        tsx.on_terminated();
        assert!(layer.find_server_tsx(&key).is_none());
    }

    #[tokio::test]
    async fn test_ack_reaches_invite_server_tsx() {
        let layer = Arc::new(TransactionLayer::default());
        let mut request = mock::request(SipMethod::Invite);

        InvServerTransaction::new(&mut request, &layer);

        let ack = mock::request(SipMethod::Ack);
        let key = TsxKey::from_incoming(&ack);

        assert!(layer.find_server_tsx(&key).is_some());
    }
}
