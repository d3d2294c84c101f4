#![warn(missing_docs)]
//! SIP Dialog Layer.
//!
//! Correlates transactions into dialogs identified by
//! `(Call-ID, local tag, remote tag)`. A dialog owns the CSeq
//! bookkeeping for both directions, a queue of in-dialog requests for
//! its consumer, the INVITE call state machine and the digest
//! authentication retry loop.
//!
//! ```text
//!  UAC (caller)                 UAS (callee)
//!      |--- INVITE ------------>|
//!      |<-- 180 Ringing --------|   early dialog
//!      |<-- 200 OK -------------|   dialog confirmed
//!      |--- ACK --------------->|
//!      |--- BYE --------------->|
//!      |<-- 200 OK -------------|   dialog terminated
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use asip_util::ArcStr;

use crate::auth::{AuthSession, DigestVerifier};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::headers::{
    Authorization, CallId, Contact, Expires, Header, Headers, ProxyAuthorization, To, CSeq,
};
use crate::message::auth::{Challenge, Credential};
use crate::message::{Request, RequestLine, Response, SipMethod, StatusCode};
use crate::peer::Peer;
use crate::transaction::{ClientTransaction, ClientTsx, InvClientTransaction};
use crate::transport::{IncomingRequest, IncomingResponse, OutgoingRequest, ToBytes};

/// Unique identifier of a SIP dialog.
///
/// Before the first tagged response arrives the remote tag is unknown;
/// the registry entry is re-keyed once it becomes known.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    /// The Call-ID shared by both sides.
    pub call_id: ArcStr,
    /// The tag this side contributed.
    pub local_tag: ArcStr,
    /// The tag the other side contributed, when known.
    pub remote_tag: Option<ArcStr>,
}

impl DialogId {
    /// Creates a dialog id.
    pub fn new(call_id: ArcStr, local_tag: ArcStr, remote_tag: Option<ArcStr>) -> Self {
        Self {
            call_id,
            local_tag,
            remote_tag,
        }
    }

    /// The same id without the remote half, used for first-response
    /// matching.
    pub fn partial(&self) -> DialogId {
        DialogId {
            call_id: self.call_id.clone(),
            local_tag: self.local_tag.clone(),
            remote_tag: None,
        }
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.call_id,
            self.local_tag,
            self.remote_tag.as_deref().unwrap_or("-")
        )
    }
}

/// The INVITE call state, as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    /// INVITE sent, nothing back yet.
    #[default]
    Calling,
    /// A provisional response arrived.
    Proceeding,
    /// A non-2xx final arrived.
    Completed,
    /// The call is established (2xx) or over.
    Terminated,
}

/// Registry of live dialogs, shared across peers.
#[derive(Default)]
pub struct DialogLayer {
    dialogs: Mutex<HashMap<DialogId, Dialog>>,
}

impl DialogLayer {
    /// Number of registered dialogs.
    pub fn len(&self) -> usize {
        self.dialogs.lock().expect("Lock failed").len()
    }

    /// `true` when no dialogs are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn insert(&self, dialog: Dialog) {
        let id = dialog.id();
        log::debug!("Registering dialog {}", id);
        self.dialogs.lock().expect("Lock failed").insert(id, dialog);
    }

    /// Finds a dialog by its full id, falling back to the partial id for
    /// the first-response case.
    pub fn find(&self, id: &DialogId) -> Option<Dialog> {
        let map = self.dialogs.lock().expect("Lock failed");

        if let Some(dialog) = map.get(id) {
            return Some(dialog.clone());
        }
        map.get(&id.partial()).cloned()
    }

    pub(crate) fn remove(&self, id: &DialogId) -> Option<Dialog> {
        let mut map = self.dialogs.lock().expect("Lock failed");
        map.remove(&id.partial());
        map.remove(id)
    }

    /// Re-keys a dialog once its remote tag became known.
    pub(crate) fn rekey(&self, old: &DialogId, dialog: Dialog) {
        let mut map = self.dialogs.lock().expect("Lock failed");
        map.remove(old);
        map.insert(dialog.id(), dialog);
    }

    /// All registered dialogs, deduplicated.
    pub(crate) fn drain(&self) -> Vec<Dialog> {
        let mut map = self.dialogs.lock().expect("Lock failed");
        let mut out: Vec<Dialog> = Vec::with_capacity(map.len());
        for (_, dialog) in map.drain() {
            if !out.iter().any(|d| Arc::ptr_eq(&d.inner, &dialog.inner)) {
                out.push(dialog);
            }
        }
        out
    }

    /// Dialogs bound to `peer`, used when its connection is lost.
    pub(crate) fn dialogs_of_peer(&self, peer: std::net::SocketAddr) -> Vec<Dialog> {
        let map = self.dialogs.lock().expect("Lock failed");
        let mut out: Vec<Dialog> = Vec::new();
        for dialog in map.values() {
            if dialog.peer().addr() == peer
                && !out.iter().any(|d| Arc::ptr_eq(&d.inner, &dialog.inner))
            {
                out.push(dialog.clone());
            }
        }
        out
    }
}

/// Everything needed to open an outbound dialog.
pub struct DialogSetup {
    /// Our address, placed in `From`.
    pub from: crate::message::SipAddr,
    /// The remote address, placed in `To` and the request URI.
    pub to: crate::message::SipAddr,
    /// Password answering digest challenges, when known.
    pub password: Option<String>,
    /// Explicit Call-ID; generated when absent.
    pub call_id: Option<ArcStr>,
    /// Extra headers for the opening request.
    pub headers: Headers,
    /// Body of the opening request.
    pub body: Option<Bytes>,
}

impl DialogSetup {
    /// Creates a setup from `From` and `To` addresses.
    pub fn new(from: &str, to: &str) -> Result<Self> {
        Ok(Self {
            from: from.parse()?,
            to: to.parse()?,
            password: None,
            call_id: None,
            headers: Headers::new(),
            body: None,
        })
    }

    /// Sets the password used for digest challenges.
    pub fn password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    /// Sets an explicit Call-ID.
    pub fn call_id(mut self, call_id: &str) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    /// Adds headers to the opening request.
    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the body of the opening request.
    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }
}

struct Inner {
    endpoint: Endpoint,
    peer: Peer,
    id: Mutex<DialogId>,
    call_id: CallId,
    /// Our identity, sent as `From` on outbound requests.
    local: crate::headers::From,
    /// Their identity, sent as `To`; gains a tag on re-key.
    remote: Mutex<To>,
    contact: Contact,
    method: SipMethod,
    inbound: bool,
    password: Option<String>,
    local_cseq: AtomicU32,
    remote_cseq: AtomicU32,
    /// Live client transactions, per method and CSeq.
    transactions: Mutex<HashMap<(SipMethod, u32), ClientTsx>>,
    /// Dropped on close so consumers stuck in `recv()` wake up.
    queue_tx: Mutex<Option<mpsc::UnboundedSender<IncomingRequest>>>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<IncomingRequest>>,
    call_state: Mutex<CallState>,
    waiter_tx: Mutex<Option<oneshot::Sender<Result<Response>>>>,
    waiter_rx: Mutex<Option<oneshot::Receiver<Result<Response>>>>,
    /// Branch and CSeq of the INVITE, for CANCEL and the 2xx ACK.
    invite: Mutex<Option<(ArcStr, u32)>>,
    last_ack: Mutex<Option<Bytes>>,
    auth: Mutex<Option<AuthSession>>,
    verifier: Mutex<Option<DigestVerifier>>,
    closing: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// A SIP dialog.
///
/// Cheap to clone; all clones share state. Consumers receive in-dialog
/// requests through [`Dialog::recv`] in wire-arrival order.
#[derive(Clone)]
pub struct Dialog {
    inner: Arc<Inner>,
}

impl Dialog {
    pub(crate) fn new_uac(
        endpoint: &Endpoint,
        peer: &Peer,
        method: SipMethod,
        setup: DialogSetup,
    ) -> Dialog {
        let mut local = crate::headers::From::new(setup.from);
        local.add_tag();
        let remote = To::new(setup.to);

        let call_id = setup
            .call_id
            .unwrap_or_else(crate::gen_call_id);

        let user = local.uri().user_str().map(str::to_string);
        let contact = peer.default_contact(user.as_deref());

        let id = DialogId::new(
            call_id.clone(),
            local.tag().expect("local tag just added").clone(),
            None,
        );

        let dialog = Self::build(
            endpoint, peer, id, call_id, local, remote, contact, method, false,
            setup.password, 0,
        );
        endpoint.dialogs().insert(dialog.clone());
        dialog
    }

    pub(crate) fn new_uas(
        endpoint: &Endpoint,
        peer: &Peer,
        request: &IncomingRequest,
        local_tag: ArcStr,
    ) -> Result<Dialog> {
        let remote_tag = request
            .headers
            .from
            .tag()
            .cloned()
            .ok_or(Error::MissingRequiredHeader("From tag"))?;

        // Our identity mirrors the request's To; their identity its From.
        let mut local = crate::headers::From::new(request.headers.to.addr.clone());
        local.set_tag(local_tag.clone());

        let mut remote = To::new(request.headers.from.addr.clone());
        remote.set_tag(remote_tag.clone());

        let call_id = request.headers.call_id.value().clone();
        let user = local.uri().user_str().map(str::to_string);
        let contact = peer.default_contact(user.as_deref());

        let id = DialogId::new(call_id.clone(), local_tag, Some(remote_tag));

        let dialog = Self::build(
            endpoint,
            peer,
            id,
            call_id,
            local,
            remote,
            contact,
            request.method(),
            true,
            None,
            request.cseq(),
        );
        endpoint.dialogs().insert(dialog.clone());
        Ok(dialog)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        endpoint: &Endpoint,
        peer: &Peer,
        id: DialogId,
        call_id: ArcStr,
        local: crate::headers::From,
        remote: To,
        contact: Contact,
        method: SipMethod,
        inbound: bool,
        password: Option<String>,
        remote_cseq: u32,
    ) -> Dialog {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (waiter_tx, waiter_rx) = oneshot::channel();

        let dialog = Dialog {
            inner: Arc::new(Inner {
                endpoint: endpoint.clone(),
                peer: peer.clone(),
                id: Mutex::new(id),
                call_id: CallId::from(call_id),
                local,
                remote: Mutex::new(remote),
                contact,
                method,
                inbound,
                password,
                local_cseq: AtomicU32::new(0),
                remote_cseq: AtomicU32::new(remote_cseq),
                transactions: Mutex::new(HashMap::new()),
                queue_tx: Mutex::new(Some(queue_tx)),
                queue_rx: tokio::sync::Mutex::new(queue_rx),
                call_state: Mutex::new(CallState::Calling),
                waiter_tx: Mutex::new(Some(waiter_tx)),
                waiter_rx: Mutex::new(Some(waiter_rx)),
                invite: Mutex::new(None),
                last_ack: Mutex::new(None),
                auth: Mutex::new(None),
                verifier: Mutex::new(None),
                closing: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        };

        log::debug!("Creating dialog {}", dialog.id());
        dialog
    }

    /// The current id of the dialog.
    pub fn id(&self) -> DialogId {
        self.inner.id.lock().expect("Lock failed").clone()
    }

    /// The peer this dialog talks to.
    pub fn peer(&self) -> &Peer {
        &self.inner.peer
    }

    /// The Call-ID of the dialog.
    pub fn call_id(&self) -> &CallId {
        &self.inner.call_id
    }

    /// The method that opened the dialog.
    pub fn method(&self) -> SipMethod {
        self.inner.method
    }

    /// `true` when the dialog was created by a remote request.
    pub fn is_inbound(&self) -> bool {
        self.inner.inbound
    }

    /// The INVITE call state.
    pub fn call_state(&self) -> CallState {
        *self.inner.call_state.lock().expect("Lock failed")
    }

    /// The highest CSeq seen from the remote side.
    pub fn remote_cseq(&self) -> u32 {
        self.inner.remote_cseq.load(Ordering::SeqCst)
    }

    fn next_cseq(&self) -> u32 {
        self.inner.local_cseq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn set_call_state(&self, state: CallState) {
        let mut guard = self.inner.call_state.lock().expect("Lock failed");
        if *guard != state {
            log::trace!("Call state [{:?} -> {:?}] {}", *guard, state, self.id());
            *guard = state;
        }
    }

    /// Receives the next in-dialog request, in wire-arrival order.
    ///
    /// Returns `None` once the dialog is closed.
    pub async fn recv(&self) -> Option<IncomingRequest> {
        self.inner.queue_rx.lock().await.recv().await
    }

    /// Resolves once the INVITE reached a final response; `Ok` carries
    /// it (including non-2xx finals, which end the call attempt).
    pub async fn ready(&self) -> Result<Response> {
        let rx = self.inner.waiter_rx.lock().expect("Lock failed").take();
        let Some(rx) = rx else {
            return Err(Error::ChannelClosed);
        };

        rx.await.map_err(|_| Error::Cancelled)?
    }

    fn resolve_waiter(&self, response: Response) {
        if let Some(tx) = self.inner.waiter_tx.lock().expect("Lock failed").take() {
            let _ = tx.send(Ok(response));
        }
    }

    pub(crate) fn fail_waiter(&self, err: Error) {
        if let Some(tx) = self.inner.waiter_tx.lock().expect("Lock failed").take() {
            let _ = tx.send(Err(err));
        }
    }

    /// Sends an in-dialog request and awaits its final response.
    ///
    /// Assigns the next CSeq, spawns exactly one client transaction and
    /// performs the digest retry loop when the response is a 401/407
    /// challenge and a password is configured.
    pub async fn request(
        &self,
        method: SipMethod,
        headers: Option<Headers>,
        body: Option<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::DialogClosed);
        }
        assert!(
            method != SipMethod::Ack,
            "ACK is sent by the dialog itself, never requested"
        );

        let extra = headers.unwrap_or_default();

        loop {
            let cseq = self.next_cseq();
            let out = self.prepare_request(method, cseq, &extra, body.clone());

            let tsx = if method == SipMethod::Invite {
                if let Some(branch) = out.branch().cloned() {
                    *self.inner.invite.lock().expect("Lock failed") = Some((branch, cseq));
                }
                let tsx = InvClientTransaction::send(
                    out,
                    self.inner.endpoint.transactions(),
                    Some(self.clone()),
                )
                .await?;
                ClientTsx::Invite(tsx)
            } else {
                let tsx = ClientTransaction::send(out, self.inner.endpoint.transactions()).await?;
                tsx.set_dialog(self.clone());
                ClientTsx::NonInvite(tsx)
            };

            self.inner
                .transactions
                .lock()
                .expect("Lock failed")
                .insert((method, cseq), tsx.clone());

            let completed = tsx.core().completed();
            let result = match timeout {
                Some(duration) => match tokio::time::timeout(duration, completed).await {
                    Ok(result) => result,
                    Err(_) => {
                        tsx.cancel();
                        Err(Error::Timeout)
                    }
                },
                None => completed.await,
            };

            self.inner
                .transactions
                .lock()
                .expect("Lock failed")
                .remove(&(method, cseq));

            let response = result?;
            let code = response.code();

            self.maybe_rekey(&response, code);

            if matches!(code.as_u16(), 401 | 407) && self.inner.password.is_some() {
                match self.handle_challenge(&response) {
                    Ok(()) => continue,
                    Err(Error::AuthenticationFailed(reason)) => {
                        return Err(Error::AuthenticationFailed(reason));
                    }
                    // No usable challenge in the response; surface it.
                    Err(_) => return self.finish_request(method, response).await,
                }
            }

            return self.finish_request(method, response).await;
        }
    }

    /// Post-processing of a final response: INVITE call state, the 2xx
    /// ACK and the auto-close windows.
    async fn finish_request(&self, method: SipMethod, response: Response) -> Result<Response> {
        let code = response.code();

        if method == SipMethod::Invite {
            if code.is_success() {
                self.set_call_state(CallState::Terminated);
                self.send_ack(&response).await?;
                self.resolve_waiter(response.clone());
            } else if code.is_final() {
                // The transaction already ACKed the failure.
                self.set_call_state(CallState::Completed);
                self.resolve_waiter(response.clone());
            }
        }

        if code.is_success() {
            self.schedule_auto_close(method, response.headers.expires());
        }

        Ok(response)
    }

    /// Answers a 401/407 by preparing an [`AuthSession`] for the next
    /// attempt. Fails when the budget is exhausted or the response
    /// carries no digest challenge.
    fn handle_challenge(&self, response: &Response) -> Result<()> {
        let (challenge, proxy) = match extract_challenge(response) {
            Some(found) => found,
            None => {
                return Err(Error::Parse(crate::error::SipParserError::new(
                    "401/407 without a digest challenge",
                )))
            }
        };

        let password = self
            .inner
            .password
            .as_deref()
            .ok_or(Error::AuthenticationFailed("no password configured"))?;
        let username = self
            .inner
            .local
            .uri()
            .user_str()
            .unwrap_or_default()
            .to_string();

        let budget = self.inner.endpoint.auth_retries();
        let mut guard = self.inner.auth.lock().expect("Lock failed");
        match guard.as_mut() {
            Some(session) => {
                session.rechallenge(challenge, proxy);
                session.take_attempt(budget)?;
            }
            None => {
                let mut session = AuthSession::new(challenge, proxy, &username, password);
                session.take_attempt(budget)?;
                *guard = Some(session);
            }
        }

        Ok(())
    }

    fn prepare_request(
        &self,
        method: SipMethod,
        cseq: u32,
        extra: &Headers,
        body: Option<Bytes>,
    ) -> OutgoingRequest {
        let remote = self.inner.remote.lock().expect("Lock failed").clone();
        let uri = remote.uri().clone();

        let mut headers = Headers::with_capacity(8 + extra.len());
        headers.push(Header::Via(self.inner.peer.generate_via(crate::gen_branch())));
        headers.push(Header::From(self.inner.local.clone()));
        headers.push(Header::To(remote));
        headers.push(Header::CallId(self.inner.call_id.clone()));
        headers.push(Header::CSeq(CSeq::new(cseq, method)));
        headers.push(Header::Contact(self.inner.contact.clone()));

        if !extra.iter().any(|h| matches!(h, Header::UserAgent(_))) {
            headers.push(Header::UserAgent(crate::headers::UserAgent::new(
                self.inner.endpoint.user_agent(),
            )));
        }

        if let Some(session) = self.inner.auth.lock().expect("Lock failed").as_mut() {
            let credential = session.credentials(
                method.as_str(),
                &uri.short_uri(),
                body.as_deref(),
            );
            if session.is_proxy() {
                headers.push(Header::ProxyAuthorization(ProxyAuthorization(
                    Credential::Digest(credential),
                )));
            } else {
                headers.push(Header::Authorization(Authorization(Credential::Digest(
                    credential,
                ))));
            }
        }

        headers.extend(extra.iter().cloned());

        OutgoingRequest {
            msg: Request {
                req_line: RequestLine { method, uri },
                headers,
                body,
            },
            addr: self.inner.peer.addr(),
            transport: self.inner.peer.transport().clone(),
            buf: None,
        }
    }

    /// Sends the ACK for a 2xx: a new branch, the INVITE's CSeq number,
    /// the To taken from the response.
    async fn send_ack(&self, response: &Response) -> Result<()> {
        let cseq = match *self.inner.invite.lock().expect("Lock failed") {
            Some((_, cseq)) => cseq,
            None => response.cseq().map(|c| c.cseq).unwrap_or(1),
        };

        let to = response
            .headers
            .to_hdr()
            .cloned()
            .unwrap_or_else(|| self.inner.remote.lock().expect("Lock failed").clone());

        // Prefer the contact the 2xx advertised as the ACK target.
        let uri = response
            .headers
            .contact()
            .map(|c| c.uri().clone())
            .unwrap_or_else(|| to.uri().clone());

        let headers = Headers::from([
            Header::Via(self.inner.peer.generate_via(crate::gen_branch())),
            Header::From(self.inner.local.clone()),
            Header::To(to),
            Header::CallId(self.inner.call_id.clone()),
            Header::CSeq(CSeq::new(cseq, SipMethod::Ack)),
        ]);

        let mut ack = OutgoingRequest {
            msg: Request {
                req_line: RequestLine {
                    method: SipMethod::Ack,
                    uri,
                },
                headers,
                body: None,
            },
            addr: self.inner.peer.addr(),
            transport: self.inner.peer.transport().clone(),
            buf: None,
        };

        let buf = ack.to_bytes()?;
        ack.buf = Some(buf.clone());
        *self.inner.last_ack.lock().expect("Lock failed") = Some(buf);

        self.inner.peer.send_request(&mut ack).await
    }

    /// Replies to an in-dialog request, through its server transaction
    /// when one is attached.
    pub async fn reply(
        &self,
        request: &IncomingRequest,
        code: StatusCode,
        headers: Option<Headers>,
        body: Option<Bytes>,
    ) -> Result<()> {
        let mut response = request.new_response(code);
        if let Some(mut headers) = headers {
            response.append_headers(&mut headers);
        }
        if let Some(body) = body {
            response.set_body(body);
        }

        match request.transaction() {
            Some(tsx) => tsx.respond(&mut response).await,
            None => self.inner.endpoint.send_response(&mut response).await,
        }
    }

    /// Sends a NOTIFY with the dialog-event defaults.
    pub async fn notify(&self, body: Option<Bytes>, headers: Option<Headers>) -> Result<Response> {
        let mut headers = headers.unwrap_or_default();

        if headers.get_other("Event").is_none() {
            headers.push(Header::other("Event", "dialog"));
        }
        if !headers.iter().any(|h| matches!(h, Header::ContentType(_))) {
            headers.push(Header::ContentType(crate::headers::ContentType::new(
                "application/dialog-info+xml",
            )));
        }
        if headers.get_other("Subscription-State").is_none() {
            headers.push(Header::other("Subscription-State", "active"));
        }

        self.request(SipMethod::Notify, Some(headers), body, None).await
    }

    /// Re-sends the opening method with a fresh Expires, pushing the
    /// auto-close window out.
    pub async fn refresh(&self, expires: u32) -> Result<Response> {
        let headers = Headers::from([Header::Expires(Expires::new(expires))]);
        self.request(self.inner.method, Some(headers), None, None).await
    }

    /// Cancels an outstanding INVITE: sends CANCEL with the INVITE's
    /// branch and CSeq and returns its response.
    pub async fn cancel(&self) -> Result<Response> {
        let (branch, cseq) = self
            .inner
            .invite
            .lock()
            .expect("Lock failed")
            .clone()
            .ok_or(Error::DialogClosed)?;

        let remote = self.inner.remote.lock().expect("Lock failed").clone();
        let uri = remote.uri().clone();

        // CANCEL reuses the INVITE's Via, branch included.
        let headers = Headers::from([
            Header::Via(self.inner.peer.generate_via(branch)),
            Header::From(self.inner.local.clone()),
            Header::To(remote),
            Header::CallId(self.inner.call_id.clone()),
            Header::CSeq(CSeq::new(cseq, SipMethod::Cancel)),
        ]);

        let out = OutgoingRequest {
            msg: Request {
                req_line: RequestLine {
                    method: SipMethod::Cancel,
                    uri,
                },
                headers,
                body: None,
            },
            addr: self.inner.peer.addr(),
            transport: self.inner.peer.transport().clone(),
            buf: None,
        };

        let tsx = ClientTransaction::send(out, self.inner.endpoint.transactions()).await?;
        tsx.completed().await
    }

    /// Sends BYE and awaits its response.
    pub async fn bye(&self) -> Result<Response> {
        self.request(SipMethod::Bye, None, None, None).await
    }

    /// Closes the dialog.
    ///
    /// Outbound REGISTER/SUBSCRIBE dialogs first un-register with
    /// `Expires: 0`; an established INVITE dialog sends BYE, a pending
    /// one CANCEL. All outstanding transactions complete with
    /// `Cancelled`.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::debug!("Closing dialog {}", self.id());

        if let Some(task) = self.inner.closing.lock().expect("Lock failed").take() {
            task.abort();
        }

        let result = if !self.inner.inbound && self.inner.method.is_refreshing() {
            let headers = Headers::from([Header::Expires(Expires::new(0))]);
            self.request_ignoring_closed(self.inner.method, Some(headers), None)
                .await
                .map(|_| ())
        } else if self.inner.method == SipMethod::Invite && !self.inner.inbound {
            match self.call_state() {
                CallState::Terminated => self.bye_ignoring_closed().await.map(|_| ()),
                CallState::Calling | CallState::Proceeding => self.cancel().await.map(|_| ()),
                CallState::Completed => Ok(()),
            }
        } else {
            Ok(())
        };

        let transactions: Vec<ClientTsx> = {
            let mut map = self.inner.transactions.lock().expect("Lock failed");
            map.drain().map(|(_, tsx)| tsx).collect()
        };
        for tsx in transactions {
            tsx.cancel();
        }

        // Wake up consumers blocked in recv().
        self.inner.queue_tx.lock().expect("Lock failed").take();

        self.inner.endpoint.dialogs().remove(&self.id());
        result
    }

    async fn request_ignoring_closed(
        &self,
        method: SipMethod,
        headers: Option<Headers>,
        body: Option<Bytes>,
    ) -> Result<Response> {
        // close() flips the flag before the farewell request goes out.
        self.inner.closed.store(false, Ordering::SeqCst);
        let result = self.request(method, headers, body, None).await;
        self.inner.closed.store(true, Ordering::SeqCst);
        result
    }

    async fn bye_ignoring_closed(&self) -> Result<Response> {
        self.inner.closed.store(false, Ordering::SeqCst);
        let result = self.bye().await;
        self.inner.closed.store(true, Ordering::SeqCst);
        result
    }

    /// Schedules a close `delay` from now, replacing any earlier
    /// schedule.
    pub fn close_later(&self, delay: Duration) {
        let mut guard = self.inner.closing.lock().expect("Lock failed");
        if let Some(task) = guard.take() {
            task.abort();
        }

        let dialog = self.clone();
        *guard = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = dialog.close().await {
                log::debug!("Deferred close of {} failed: {}", dialog.id(), err);
            }
        }));
    }

    fn cancel_close_timer(&self) {
        if let Some(task) = self.inner.closing.lock().expect("Lock failed").take() {
            task.abort();
        }
    }

    /// Arms the auto-close window after a successful exchange:
    /// `1.1 * Expires` for refreshing methods, the idle delay otherwise.
    /// NOTIFY keeps the dialog alive as-is.
    fn schedule_auto_close(&self, method: SipMethod, expires: Option<u32>) {
        if method == SipMethod::Notify {
            return;
        }

        if method.is_refreshing() && !self.inner.inbound {
            match expires {
                Some(0) => (),
                Some(expires) => {
                    let delay = Duration::from_secs(expires as u64)
                        + Duration::from_secs(expires as u64) / 10;
                    self.close_later(delay);
                }
                None => self.close_later(self.inner.endpoint.idle_close()),
            }
        } else if method != SipMethod::Invite {
            self.close_later(self.inner.endpoint.idle_close());
        }
    }

    /// Re-keys the dialog once the first tagged response arrives.
    ///
    /// 401s keep the provisional key: the retry opens the real dialog.
    fn maybe_rekey(&self, response: &Response, code: StatusCode) {
        if matches!(code.as_u16(), 401 | 407) {
            return;
        }
        let Some(tag) = response.headers.to_hdr().and_then(|to| to.tag().cloned()) else {
            return;
        };

        let old = self.id();
        if old.remote_tag.is_some() {
            return;
        }

        self.inner
            .remote
            .lock()
            .expect("Lock failed")
            .set_tag(tag.clone());

        let new = DialogId::new(old.call_id.clone(), old.local_tag.clone(), Some(tag));
        *self.inner.id.lock().expect("Lock failed") = new;

        log::trace!("Dialog re-keyed {} -> {}", old, self.id());
        self.inner.endpoint.dialogs().rekey(&old, self.clone());
    }

    /// Delivers an in-dialog request from the dispatcher.
    pub(crate) fn receive_request(&self, request: IncomingRequest) {
        // Track the highest CSeq seen from the remote side.
        let cseq = request.cseq();
        self.inner.remote_cseq.fetch_max(cseq, Ordering::SeqCst);

        let method = request.method();
        match method {
            SipMethod::Ack => {
                // The 2xx ACK confirms the call; retransmitted ACKs for
                // non-2xx finals were absorbed by the transaction layer.
                log::trace!("ACK absorbed by dialog {}", self.id());
            }
            _ => {
                let sender = self.inner.queue_tx.lock().expect("Lock failed").clone();
                let delivered = sender.is_some_and(|tx| tx.send(request).is_ok());
                if !delivered {
                    log::debug!("Dialog {} queue closed; request dropped", self.id());
                }
                if method == SipMethod::Bye {
                    self.set_call_state(CallState::Terminated);
                }
            }
        }

        // Inbound dialogs idle out between exchanges; a NOTIFY keeps
        // the window as it is, and outbound refreshers keep the
        // 1.1 * Expires window armed by their own requests.
        if self.inner.inbound {
            self.cancel_close_timer();
            if method != SipMethod::Notify {
                self.close_later(self.inner.endpoint.idle_close());
            }
        }
    }

    /// Handles a response that matched the dialog but no transaction,
    /// typically a retransmitted 2xx whose INVITE transaction is gone.
    pub(crate) async fn receive_response(&self, response: &IncomingResponse) {
        self.maybe_rekey(&response.response, response.code());

        if self.inner.method == SipMethod::Invite
            && response.code().is_final()
            && matches!(self.call_state(), CallState::Terminated | CallState::Completed)
        {
            let ack = self.inner.last_ack.lock().expect("Lock failed").clone();
            if let Some(buf) = ack {
                if let Err(err) = self.inner.peer.send_raw(&buf).await {
                    log::debug!("Failed to re-ACK: {}", err);
                }
            }
        }
    }

    /// Called by the INVITE client transaction on provisionals.
    pub(crate) fn on_provisional(&self, _code: StatusCode) {
        if self.call_state() == CallState::Calling {
            self.set_call_state(CallState::Proceeding);
        }
    }

    /// Called by the INVITE server transaction when a CANCEL ended the
    /// pending INVITE.
    pub(crate) fn on_remote_cancel(&self) {
        self.set_call_state(CallState::Terminated);
    }

    /// Fails the dialog because its transport went away.
    pub(crate) fn connection_lost(&self) {
        let transactions: Vec<ClientTsx> = {
            let mut map = self.inner.transactions.lock().expect("Lock failed");
            map.drain().map(|(_, tsx)| tsx).collect()
        };
        for tsx in transactions {
            tsx.core().fail(Error::ConnectionClosed);
            tsx.core().on_terminated();
        }

        self.inner.closed.store(true, Ordering::SeqCst);
        self.cancel_close_timer();
        self.inner.queue_tx.lock().expect("Lock failed").take();
        self.inner.endpoint.dialogs().remove(&self.id());
    }

    /// Challenges an unauthenticated request with 401 and a fresh
    /// digest challenge.
    pub async fn unauthorized(&self, request: &IncomingRequest, realm: &str) -> Result<()> {
        let challenge = {
            let mut guard = self.inner.verifier.lock().expect("Lock failed");
            let verifier = guard.get_or_insert_with(|| DigestVerifier::new(realm));
            verifier.challenge().clone()
        };

        let headers = Headers::from([Header::WWWAuthenticate(
            crate::headers::WWWAuthenticate(Challenge::Digest(challenge)),
        )]);

        self.reply(request, StatusCode::Unauthorized, Some(headers), None)
            .await
    }

    /// Validates the credentials on a request against the challenge this
    /// dialog issued. CANCEL is exempt per RFC 3261.
    pub fn validate_auth(&self, request: &IncomingRequest, password: &str) -> bool {
        if request.method() == SipMethod::Cancel {
            return true;
        }

        let credential = request.request.headers.find_map(|h| match h {
            Header::Authorization(auth) => Some(&auth.0),
            Header::ProxyAuthorization(auth) => Some(&auth.0),
            _ => None,
        });

        let Some(Credential::Digest(digest)) = credential else {
            return false;
        };

        let mut guard = self.inner.verifier.lock().expect("Lock failed");
        let Some(verifier) = guard.as_mut() else {
            return false;
        };

        verifier.verify(
            digest,
            request.method().as_str(),
            password,
            request.request.body.as_deref(),
        )
    }
}

impl fmt::Debug for Dialog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Dialog {} {} peer={}>",
            self.inner.method,
            self.id(),
            self.inner.peer.addr()
        )
    }
}

/// Pulls the digest challenge out of a 401/407 response.
fn extract_challenge(response: &Response) -> Option<(crate::message::auth::DigestChallenge, bool)> {
    for header in response.headers.iter() {
        match header {
            Header::WWWAuthenticate(www) => {
                if let Challenge::Digest(digest) = &www.0 {
                    return Some((digest.clone(), false));
                }
            }
            Header::ProxyAuthenticate(proxy) => {
                if let Challenge::Digest(digest) = &proxy.0 {
                    return Some((digest.clone(), true));
                }
            }
            _ => (),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialog_id_partial() {
        let id = DialogId::new("call".into(), "local".into(), Some("remote".into()));
        let partial = id.partial();

        assert_eq!(partial.call_id, id.call_id);
        assert_eq!(partial.local_tag, id.local_tag);
        assert!(partial.remote_tag.is_none());
    }

    #[test]
    fn test_extract_challenge_prefers_www() {
        let mut response = Response::new(StatusCode::Unauthorized);
        response.headers.push(Header::WWWAuthenticate(
            crate::headers::WWWAuthenticate(Challenge::Digest(
                crate::message::auth::DigestChallenge::new("x", "N"),
            )),
        ));

        let (challenge, proxy) = extract_challenge(&response).unwrap();
        assert!(!proxy);
        assert_eq!(challenge.realm.as_ref().unwrap(), "x");
    }

    #[test]
    fn test_extract_challenge_proxy() {
        let mut response = Response::new(StatusCode::ProxyAuthenticationRequired);
        response.headers.push(Header::ProxyAuthenticate(
            crate::headers::ProxyAuthenticate(Challenge::Digest(
                crate::message::auth::DigestChallenge::new("p", "M"),
            )),
        ));

        let (_, proxy) = extract_challenge(&response).unwrap();
        assert!(proxy);
    }
}
