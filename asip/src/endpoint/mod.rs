#![deny(missing_docs)]
//! SIP Endpoint.
//!
//! The endpoint is the process-wide application value: it owns the
//! transport, transaction and dialog layers, the peer pool, the
//! dialplan and the defaults, and routes every inbound message to
//! either a transaction, a dialog, the service chain or the dialplan.

pub mod builder;

#[cfg(test)]
mod tests;

pub use builder::Builder;

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use asip_util::{ArcStr, DnsResolver};
use bytes::Bytes;

use crate::dialog::{DialogId, DialogLayer};
use crate::dialplan::{Dialplan, IncomingCall};
use crate::error::Result;
use crate::headers::{Header, Headers, UserAgent};
use crate::message::{Host, HostPort, SipMethod, StatusCode, TransportKind};
use crate::peer::Peer;
use crate::proxy::ProxyDialog;
use crate::service::SipService;
use crate::transaction::{InvServerTransaction, ServerTransaction, ServerTsx, TransactionLayer, TsxKey};
use crate::transport::{
    tcp::TcpServer, udp::UdpTransport, ws::WsServer, IncomingRequest, IncomingResponse,
    OutgoingAddr, OutgoingResponse, ToBytes, Transport, TransportLayer,
};

pub(crate) struct Defaults {
    pub user_agent: String,
    pub override_contact_host: Option<String>,
    pub auth_retries: u32,
    pub idle_close: Duration,
    pub debug: bool,
}

type PeerKey = (SocketAddr, Option<SocketAddr>);

pub(crate) struct Inner {
    pub name: String,
    pub transport: TransportLayer,
    pub transactions: Arc<TransactionLayer>,
    pub dialogs: Arc<DialogLayer>,
    pub dialplan: Option<Box<dyn Dialplan>>,
    pub services: Box<[Box<dyn SipService>]>,
    pub resolver: DnsResolver,
    pub capabilities: Headers,
    pub defaults: Defaults,
    pub listen: Vec<(TransportKind, SocketAddr)>,
    pub peers: Mutex<HashMap<PeerKey, Peer>>,
    pub proxies: Mutex<HashMap<ArcStr, ProxyDialog>>,
}

/// The SIP endpoint.
///
/// Cheap to clone; all clones share state. Built with
/// [`endpoint::Builder`](Builder).
#[derive(Clone)]
pub struct Endpoint(pub(crate) Arc<Inner>);

impl Endpoint {
    /// Returns a builder to create an `Endpoint`.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// The endpoint name.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// The User-Agent string stamped on emitted requests.
    pub fn user_agent(&self) -> &str {
        &self.0.defaults.user_agent
    }

    pub(crate) fn override_contact_host(&self) -> Option<&String> {
        self.0.defaults.override_contact_host.as_ref()
    }

    pub(crate) fn auth_retries(&self) -> u32 {
        self.0.defaults.auth_retries
    }

    pub(crate) fn idle_close(&self) -> Duration {
        self.0.defaults.idle_close
    }

    /// The transaction registry.
    pub fn transactions(&self) -> &Arc<TransactionLayer> {
        &self.0.transactions
    }

    /// The dialog registry.
    pub fn dialogs(&self) -> &Arc<DialogLayer> {
        &self.0.dialogs
    }

    pub(crate) fn transport(&self) -> &TransportLayer {
        &self.0.transport
    }

    /// Starts the configured listeners and runs the inbound pump until
    /// the endpoint is closed.
    pub async fn run(&self) -> Result<()> {
        for (kind, addr) in self.0.listen.clone() {
            self.listen(kind, addr).await?;
        }

        self.0.transport.handle_events(self).await
    }

    /// Opens one listener and returns the address it bound.
    pub async fn listen(&self, kind: TransportKind, addr: SocketAddr) -> Result<SocketAddr> {
        let sender = self.0.transport.sender().clone();

        match kind {
            TransportKind::Udp => {
                let transport = UdpTransport::start(Some(addr), sender).await?;
                let bound = transport.addr();
                self.0.transport.add_transport(transport);
                Ok(bound)
            }
            TransportKind::Tcp | TransportKind::Tls => TcpServer::start(addr, sender).await,
            TransportKind::Ws | TransportKind::Wss => WsServer::start(addr, sender).await,
        }
    }

    /// Returns a peer for `remote`, reusing a pooled one when possible.
    pub async fn connect(
        &self,
        kind: TransportKind,
        remote: SocketAddr,
        local: Option<SocketAddr>,
    ) -> Result<Peer> {
        self.get_or_create_peer(kind, remote, local).await
    }

    /// Finds the peer for `(peer_addr, local_addr)` or dials a new
    /// connection. A pending peer keyed without a local address is
    /// collapsed onto the bound address once the socket exists.
    pub async fn get_or_create_peer(
        &self,
        kind: TransportKind,
        peer_addr: SocketAddr,
        local_addr: Option<SocketAddr>,
    ) -> Result<Peer> {
        {
            let peers = self.0.peers.lock().expect("Lock failed");
            let found = match local_addr {
                Some(local) => peers.get(&(peer_addr, Some(local))).cloned(),
                None => peers
                    .iter()
                    .find(|((addr, _), _)| *addr == peer_addr)
                    .map(|(_, peer)| peer.clone()),
            };
            if let Some(peer) = found {
                return Ok(peer);
            }
        }

        let transport = self.0.transport.obtain(kind, peer_addr, local_addr).await?;
        let peer = Peer::new(self.clone(), transport.clone(), peer_addr);

        let mut peers = self.0.peers.lock().expect("Lock failed");
        peers.remove(&(peer_addr, None));
        peers
            .entry((peer_addr, Some(transport.addr())))
            .or_insert_with(|| peer.clone());

        Ok(peer)
    }

    /// The peer an inbound message arrived from, pooled by its source
    /// address and the receiving transport.
    pub(crate) fn peer_of_incoming(
        &self,
        transport: &Arc<dyn Transport>,
        addr: SocketAddr,
    ) -> Peer {
        let key = (addr, Some(transport.addr()));
        let mut peers = self.0.peers.lock().expect("Lock failed");

        peers
            .entry(key)
            .or_insert_with(|| Peer::new(self.clone(), transport.clone(), addr))
            .clone()
    }

    /// Resolves a DNS name to its first address.
    pub async fn resolve(&self, name: &str) -> std::result::Result<IpAddr, io::Error> {
        self.0.resolver.resolve(name).await
    }

    pub(crate) fn register_proxy(&self, proxy: ProxyDialog) {
        self.0
            .proxies
            .lock()
            .expect("Lock failed")
            .insert(proxy.branch().clone(), proxy);
    }

    pub(crate) fn remove_proxy(&self, branch: &ArcStr) {
        self.0.proxies.lock().expect("Lock failed").remove(branch);
    }

    /// Responds statelessly to a request, outside any transaction.
    pub async fn respond(&self, request: &IncomingRequest, code: StatusCode) -> Result<()> {
        assert!(
            request.transaction().is_none(),
            "Request already has a transaction"
        );

        let mut response = self.new_response(request, code);
        self.send_response(&mut response).await
    }

    /// Builds a response mirroring the request, stamped with our
    /// User-Agent.
    pub fn new_response(&self, request: &IncomingRequest, code: StatusCode) -> OutgoingResponse {
        let mut response = request.new_response(code);
        response
            .headers_mut()
            .push(Header::UserAgent(UserAgent::new(self.user_agent())));
        response
    }

    /// Encodes and sends a response to its destination, resolving the
    /// Via sent-by when needed.
    pub async fn send_response(&self, response: &mut OutgoingResponse) -> Result<()> {
        log::debug!(
            "=> Response {} {}",
            response.status_code().as_u16(),
            response.reason()
        );
        let encoded_buf = response.to_bytes()?;

        match &response.addr {
            OutgoingAddr::HostPort {
                host: HostPort { host, port },
                protocol,
            } => {
                let ip = match host {
                    Host::DomainName(domain) => self.resolve(domain).await?,
                    Host::IpAddr(ip) => *ip,
                };
                let addr = SocketAddr::new(ip, port.unwrap_or(protocol.default_port()));

                let transport = self.0.transport.find(addr, *protocol).ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("No transport found for {} {}", addr, protocol),
                    )
                })?;
                transport.send(&encoded_buf, &addr).await?;
            }
            OutgoingAddr::Addr { addr, transport } => {
                transport.send(&encoded_buf, addr).await?;
            }
        }

        Ok(())
    }

    /// Inbound request dispatch: transaction, then CANCEL special
    /// handling, then dialog, then services, then dialplan.
    pub(crate) async fn process_request(&self, request: IncomingRequest) -> Result<()> {
        log::debug!("<= Request {} from /{}", request.method(), request.addr());

        if self.0.transactions.handle_request(&request).await? {
            return Ok(());
        }

        if request.method() == SipMethod::Cancel {
            return self.handle_cancel(request).await;
        }

        // In-dialog requests carry our tag in To.
        if let Some(local_tag) = request.headers.to.tag() {
            let id = DialogId::new(
                request.headers.call_id.value().clone(),
                local_tag.clone(),
                request.headers.from.tag().cloned(),
            );

            if let Some(dialog) = self.0.dialogs.find(&id) {
                let mut request = request;
                match request.method() {
                    SipMethod::Ack => (),
                    SipMethod::Invite => {
                        InvServerTransaction::new(&mut request, &self.0.transactions);
                    }
                    _ => {
                        ServerTransaction::new(&mut request, &self.0.transactions);
                    }
                }
                dialog.receive_request(request);
                return Ok(());
            }
        }

        if request.method() == SipMethod::Ack {
            log::debug!("Discarding ACK without a matching transaction or dialog");
            return Ok(());
        }

        let mut slot = Some(request);
        for service in self.0.services.iter() {
            service.on_incoming_request(self, &mut slot).await?;
            if slot.is_none() {
                return Ok(());
            }
        }
        let request = slot.expect("services left the request in place");

        self.route_request(request).await
    }

    /// Resolves the dialplan and runs the handler for an out-of-dialog
    /// request.
    async fn route_request(&self, mut request: IncomingRequest) -> Result<()> {
        let handler = match &self.0.dialplan {
            Some(dialplan) => dialplan.resolve(request.method(), &request).await,
            None => None,
        };

        let Some(handler) = handler else {
            log::debug!(
                "Request ({}, cseq={}) from /{} was unhandled by any service",
                request.method(),
                request.cseq(),
                request.addr()
            );

            return match request.method() {
                // A bare capability probe gets a default answer.
                SipMethod::Options => {
                    let mut response = self.new_response(&request, StatusCode::Ok);
                    let mut capabilities = self.0.capabilities.clone();
                    response.append_headers(&mut capabilities);
                    self.send_response(&mut response).await
                }
                _ => self.respond(&request, StatusCode::NotImplemented).await,
            };
        };

        // The server transaction absorbs retransmissions while the
        // handler runs; for INVITE it also answers 100 Trying.
        match request.method() {
            SipMethod::Invite => {
                InvServerTransaction::new(&mut request, &self.0.transactions);
            }
            SipMethod::Ack => (),
            _ => {
                ServerTransaction::new(&mut request, &self.0.transactions);
            }
        }

        let peer = self.peer_of_incoming(&request.transport, request.packet.addr);
        let endpoint = self.clone();

        tokio::spawn(async move {
            let failed = request.clone();
            let call = IncomingCall::new(endpoint.clone(), peer, request);

            if let Err(err) = handler.call(call).await {
                log::warn!("Handler failed: {}", err);

                let mut response = endpoint.new_response(&failed, StatusCode::ServerInternalError);
                if endpoint.0.defaults.debug {
                    response.set_body(Bytes::from(err.to_string()));
                }

                let result = match failed.transaction() {
                    Some(tsx) => tsx.respond(&mut response).await,
                    None => endpoint.send_response(&mut response).await,
                };
                if let Err(err) = result {
                    log::debug!("Failed to send 500: {}", err);
                }
            }
        });

        Ok(())
    }

    /// CANCEL matching: an outstanding INVITE with the same branch is
    /// terminated with 487 and the CANCEL gets 200; a known dialog
    /// without a transaction gets 481; anything else is dropped.
    async fn handle_cancel(&self, mut request: IncomingRequest) -> Result<()> {
        let invite_key = TsxKey::from_incoming(&request).as_invite();

        if let Some(ServerTsx::Invite(invite_tsx)) = self.0.transactions.find_server_tsx(&invite_key)
        {
            // Answer the CANCEL through its own transaction so its
            // retransmissions see the cached 200.
            let cancel_tsx = ServerTransaction::new(&mut request, &self.0.transactions);
            invite_tsx.cancelled().await?;

            let mut ok = self.new_response(&request, StatusCode::Ok);
            return cancel_tsx.respond(&mut ok).await;
        }

        let id = DialogId::new(
            request.headers.call_id.value().clone(),
            request.headers.to.tag().cloned().unwrap_or_default(),
            request.headers.from.tag().cloned(),
        );

        if self.0.dialogs.find(&id).is_some() {
            return self
                .respond(&request, StatusCode::CallOrTransactionDoesNotExist)
                .await;
        }

        log::debug!("Discarding CANCEL without a matching INVITE or dialog");
        Ok(())
    }

    /// Inbound response dispatch: transaction, then proxy reverse path,
    /// then dialog, then services.
    pub(crate) async fn process_response(&self, response: IncomingResponse) -> Result<()> {
        log::debug!(
            "<= Response ({} {}) from /{}",
            response.code().as_u16(),
            response.response.reason(),
            response.addr()
        );

        let mut response = response;
        if self.0.transactions.handle_response(&mut response).await? {
            return Ok(());
        }

        // A response carrying one of our proxy branches travels the
        // reverse path.
        if let Some(branch) = response.headers.via.branch() {
            let proxy = self.0.proxies.lock().expect("Lock failed").get(branch).cloned();
            if let Some(proxy) = proxy {
                return proxy.forward_response(&response).await;
            }
        }

        if let Some(local_tag) = response.headers.from.tag() {
            let id = DialogId::new(
                response.headers.call_id.value().clone(),
                local_tag.clone(),
                response.headers.to.tag().cloned(),
            );

            if let Some(dialog) = self.0.dialogs.find(&id) {
                dialog.receive_response(&response).await;
                return Ok(());
            }
        }

        let mut slot = Some(response);
        for service in self.0.services.iter() {
            service.on_incoming_response(self, &mut slot).await?;
            if slot.is_none() {
                return Ok(());
            }
        }

        if let Some(response) = slot {
            log::debug!(
                "Response ({} {}) from /{} was unhandled by any service",
                response.code().as_u16(),
                response.response.reason(),
                response.addr()
            );
        }

        Ok(())
    }

    /// Reacts to a lost connection: every transaction and dialog bound
    /// to the peer completes with `ConnectionClosed`.
    pub(crate) async fn on_transport_closed(&self, transport: &Arc<dyn Transport>) {
        let Some(remote) = transport.remote() else {
            return;
        };
        log::debug!("Connection to {} lost", remote);

        self.0.transactions.fail_peer(remote);

        for dialog in self.0.dialogs.dialogs_of_peer(remote) {
            dialog.connection_lost();
        }

        let mut peers = self.0.peers.lock().expect("Lock failed");
        peers.retain(|(addr, _), _| *addr != remote);
    }

    /// Closes the endpoint: drains all dialogs first (un-registering
    /// refreshers with `Expires: 0`), then drops the connection pool.
    pub async fn close(&self) -> Result<()> {
        log::debug!("Closing endpoint {}", self.0.name);

        for dialog in self.0.dialogs.drain() {
            if let Err(err) = dialog.close().await {
                log::debug!("Failed to close dialog {}: {}", dialog.id(), err);
            }
        }

        self.0.peers.lock().expect("Lock failed").clear();
        self.0.proxies.lock().expect("Lock failed").clear();
        self.0.transport.clear();

        Ok(())
    }
}
