#![warn(missing_docs)]
//! SIP Transport Layer.
//!
//! Owns every socket the endpoint speaks through: UDP listeners plus
//! TCP/WebSocket connections keyed by `(protocol, peer, local)`.
//! Inbound bytes are framed per transport, parsed once and handed to the
//! endpoint for dispatch.

use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::headers::{
    CSeq, CallId, ContentLength, From as FromHdr, Header, Headers, MaxForwards, SipHeaderParse,
    To, Via,
};
use crate::message::{HostPort, Request, Response, SipMethod, SipMsg, StatusCode, TransportKind};
use crate::parser::Parser;
use crate::transaction::{ClientTsx, ServerTsx, TsxKey};

pub mod tcp;
pub mod udp;
pub mod ws;

mod decoder;

pub(crate) use decoder::StreamingDecoder;

/// Abstraction over one SIP transport: a UDP socket, a TCP connection or
/// a WebSocket.
#[async_trait::async_trait]
pub trait Transport: Sync + Send + 'static {
    /// Sends a buffer to the given remote socket address.
    ///
    /// Returns the number of bytes sent or an I/O error. Connection
    /// oriented transports ignore `addr` and write to their stream.
    async fn send(&self, buf: &[u8], addr: &SocketAddr) -> Result<usize>;

    /// Returns the transport kind (UDP, TCP, WS, ...).
    fn protocol(&self) -> TransportKind;

    /// Returns the local socket address bound to this transport.
    fn addr(&self) -> SocketAddr;

    /// Returns the remote address for connection oriented transports.
    fn remote(&self) -> Option<SocketAddr> {
        None
    }

    /// Returns the local transport name as printed in logs and Via
    /// headers.
    fn local_name(&self) -> Cow<'_, str>;

    /// Returns `true` if the transport retransmits on its own (TCP, WS).
    fn reliable(&self) -> bool;

    /// Returns `true` if the transport is TLS protected.
    fn secure(&self) -> bool;

    /// Checks if `addr` belongs to the same address family as the local
    /// socket.
    fn is_same_af(&self, addr: &SocketAddr) -> bool {
        let our_addr = self.addr();

        (addr.is_ipv4() && our_addr.is_ipv4()) || (addr.is_ipv6() && our_addr.is_ipv6())
    }

    /// The Via protocol token for messages sent through this transport.
    fn via_transport(&self) -> TransportKind {
        self.protocol()
    }

    /// The key identifying this transport in the listener table.
    fn key(&self) -> TransportKey {
        TransportKey::new(self.addr(), self.protocol())
    }
}

/// Key of a listening transport: local address plus kind.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TransportKey {
    addr: SocketAddr,
    kind: TransportKind,
}

impl TransportKey {
    /// Creates a new `TransportKey`.
    pub fn new(addr: SocketAddr, kind: TransportKind) -> Self {
        TransportKey { addr, kind }
    }
}

/// Key of one established connection: kind plus both endpoints.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnectionKey {
    /// The transport kind.
    pub kind: TransportKind,
    /// The remote endpoint.
    pub peer: SocketAddr,
    /// The local endpoint.
    pub local: SocketAddr,
}

/// The raw binary content of one datagram, frame or framed stream
/// message.
#[derive(Clone)]
pub struct Payload(Bytes);

impl Payload {
    /// Creates a new `Payload`.
    #[inline]
    pub fn new(bytes: Bytes) -> Self {
        Payload(bytes)
    }

    /// Returns the raw byte buffer.
    pub fn buf(&self) -> &[u8] {
        &self.0
    }
}

/// One received SIP packet.
#[derive(Clone)]
pub struct Packet {
    /// The packet payload.
    pub payload: Payload,
    /// The address of the sender.
    pub addr: SocketAddr,
    /// The time the packet was received.
    pub time: SystemTime,
}

/// Where an outbound response is sent.
pub enum OutgoingAddr {
    /// Resolved later from a Via sent-by.
    HostPort {
        /// The host and port to resolve.
        host: HostPort,
        /// The transport protocol to use.
        protocol: TransportKind,
    },
    /// A fully resolved address and transport.
    Addr {
        /// The socket address.
        addr: SocketAddr,
        /// The transport to use.
        transport: Arc<dyn Transport>,
    },
}

/// Conversion of a message into its wire bytes.
pub trait ToBytes: Sized {
    /// Encodes the message.
    fn to_bytes(&self) -> Result<Bytes>;
}

fn write_headers_and_body(
    buf_writer: &mut bytes::buf::Writer<BytesMut>,
    headers: &Headers,
    body: Option<&Bytes>,
    ensure_max_forwards: bool,
) -> Result<()> {
    // Content-Length is computed from the body on emission; any stale
    // header entry is skipped.
    for header in headers.iter() {
        if matches!(header, Header::ContentLength(_)) {
            continue;
        }
        write!(buf_writer, "{header}\r\n")?;
    }

    if ensure_max_forwards
        && !headers.iter().any(|h| matches!(h, Header::MaxForwards(_)))
    {
        write!(buf_writer, "{}\r\n", MaxForwards::default())?;
    }

    let body_len = body.map(|b| b.len()).unwrap_or(0);
    write!(buf_writer, "{}: {}\r\n", ContentLength::NAME, body_len)?;
    write!(buf_writer, "\r\n")?;

    if let Some(body) = body {
        buf_writer.write_all(body).map_err(Error::Io)?;
    }

    Ok(())
}

/// An outbound SIP request.
pub struct OutgoingRequest {
    /// The SIP request message.
    pub msg: Request,
    /// The address to send the request to.
    pub addr: SocketAddr,
    /// The transport to use for sending the request.
    pub transport: Arc<dyn Transport>,
    /// The encoded buffer, cached after the first encode.
    pub buf: Option<Bytes>,
}

impl OutgoingRequest {
    /// Returns the request method.
    pub fn method(&self) -> SipMethod {
        self.msg.method()
    }

    /// The branch of the topmost Via, set at construction time.
    pub fn branch(&self) -> Option<&asip_util::ArcStr> {
        self.msg.headers.top_via().and_then(|via| via.branch())
    }
}

impl ToBytes for OutgoingRequest {
    fn to_bytes(&self) -> Result<Bytes> {
        let estimated_message_size = if self.msg.body.is_none() { 800 } else { 1500 };
        let buf = BytesMut::with_capacity(estimated_message_size);
        let mut buf_writer = buf.writer();

        write!(buf_writer, "{}", &self.msg.req_line)?;
        write_headers_and_body(&mut buf_writer, &self.msg.headers, self.msg.body.as_ref(), true)?;

        Ok(buf_writer.into_inner().freeze())
    }
}

/// An outbound SIP response.
pub struct OutgoingResponse {
    /// The SIP response message.
    pub response: Response,
    /// The address to send the response to.
    pub addr: OutgoingAddr,
    /// The encoded buffer, cached after the first encode.
    pub buf: Option<Bytes>,
}

impl OutgoingResponse {
    /// Returns the message status code.
    pub fn status_code(&self) -> StatusCode {
        self.response.status_line.code
    }

    /// Returns the message reason text.
    pub fn reason(&self) -> &str {
        &self.response.status_line.reason
    }

    /// Returns `true` if this is a provisional response.
    pub fn is_provisional(&self) -> bool {
        self.response.status_line.code.is_provisional()
    }

    /// Appends headers to the message.
    pub fn append_headers(&mut self, other: &mut Headers) {
        self.response.append_headers(other);
    }

    /// Sets the message body.
    pub fn set_body(&mut self, body: Bytes) {
        self.response.body = Some(body);
    }

    /// Returns a mutable reference to the headers.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.response.headers
    }
}

impl ToBytes for OutgoingResponse {
    fn to_bytes(&self) -> Result<Bytes> {
        let estimated_message_size = if self.response.body.is_none() { 800 } else { 1500 };
        let buf = BytesMut::with_capacity(estimated_message_size);
        let mut buf_writer = buf.writer();

        write!(buf_writer, "{}", &self.response.status_line)?;
        write_headers_and_body(
            &mut buf_writer,
            &self.response.headers,
            self.response.body.as_ref(),
            false,
        )?;

        Ok(buf_writer.into_inner().freeze())
    }
}

/// The mandatory headers of an inbound message, extracted once at the
/// transport boundary.
#[derive(Clone)]
pub struct RequestHeaders {
    /// The topmost Via header, with `received` stamped.
    pub via: Via,
    /// The From header.
    pub from: FromHdr,
    /// The To header.
    pub to: To,
    /// The Call-ID header.
    pub call_id: CallId,
    /// The CSeq header.
    pub cseq: CSeq,
}

/// A received SIP request.
#[derive(Clone)]
pub struct IncomingRequest {
    /// The parsed request.
    pub request: Request,
    /// The transport the request arrived on.
    pub transport: Arc<dyn Transport>,
    /// The packet that carried the request.
    pub packet: Packet,
    /// The server transaction attached to this request, if any.
    pub(crate) transaction: Option<ServerTsx>,
    /// The mandatory headers of the request.
    pub headers: RequestHeaders,
}

impl IncomingRequest {
    /// Returns the message method.
    pub fn method(&self) -> SipMethod {
        self.request.method()
    }

    /// Returns `true` if the message method matches `method`.
    #[inline(always)]
    pub fn is_method(&self, method: &SipMethod) -> bool {
        &self.request.method() == method
    }

    /// The source socket address of the packet.
    pub fn addr(&self) -> &SocketAddr {
        &self.packet.addr
    }

    /// The `To` header of the request.
    pub fn to(&self) -> &To {
        &self.headers.to
    }

    /// The `From` header of the request.
    pub fn from(&self) -> &FromHdr {
        &self.headers.from
    }

    /// The `Call-ID` header of the request.
    pub fn call_id(&self) -> &CallId {
        &self.headers.call_id
    }

    /// The CSeq sequence number of the request.
    pub fn cseq(&self) -> u32 {
        self.headers.cseq.cseq
    }

    /// The transaction key for this request, when one is attached.
    pub fn tsx_key(&self) -> Option<&TsxKey> {
        self.transaction.as_ref().map(|tsx| tsx.key())
    }

    /// The server transaction attached to this request, when one exists.
    pub fn transaction(&self) -> Option<&ServerTsx> {
        self.transaction.as_ref()
    }

    pub(crate) fn set_transaction(&mut self, tsx: ServerTsx) {
        self.transaction = Some(tsx);
    }

    /// Builds a response to this request.
    ///
    /// The Via stack, Record-Route set, From, Call-ID and CSeq are
    /// mirrored from the request; the To header gains a tag for non-100
    /// responses (derived from the branch, so retries agree on it). The
    /// response is addressed straight back at the packet source, which
    /// honors `received`/`rport` symmetry (RFC 3581).
    pub fn new_response(&self, code: StatusCode) -> OutgoingResponse {
        let mut headers = Headers::with_capacity(8);

        headers.push(Header::Via(self.headers.via.clone()));
        headers.extend(
            self.request
                .headers
                .vias()
                .skip(1)
                .cloned()
                .map(Header::Via),
        );
        headers.extend(
            self.request
                .headers
                .iter()
                .filter(|h| matches!(h, Header::RecordRoute(_)))
                .cloned(),
        );

        headers.push(Header::From(self.headers.from.clone()));

        let mut to = self.headers.to.clone();
        if to.tag().is_none() && code.as_u16() > 100 {
            if let Some(branch) = self.headers.via.branch() {
                to.set_tag(crate::tag_from_branch(branch));
            } else {
                to.add_tag();
            }
        }
        headers.push(Header::To(to));

        headers.push(Header::CallId(self.headers.call_id.clone()));
        headers.push(Header::CSeq(self.headers.cseq));

        OutgoingResponse {
            response: Response::new_with_headers(code, headers),
            addr: OutgoingAddr::Addr {
                addr: self.packet.addr,
                transport: self.transport.clone(),
            },
            buf: None,
        }
    }
}

/// A received SIP response.
#[derive(Clone)]
pub struct IncomingResponse {
    /// The parsed response.
    pub response: Response,
    /// The transport the response arrived on.
    pub transport: Arc<dyn Transport>,
    /// The packet that carried the response.
    pub packet: Packet,
    /// The client transaction this response matched, if any.
    pub(crate) transaction: Option<ClientTsx>,
    /// The mandatory headers of the response.
    pub headers: RequestHeaders,
}

impl IncomingResponse {
    /// Returns the status code.
    pub fn code(&self) -> StatusCode {
        self.response.code()
    }

    /// The method this response answers.
    pub fn cseq_method(&self) -> SipMethod {
        self.headers.cseq.method
    }

    /// The source socket address of the packet.
    pub fn addr(&self) -> &SocketAddr {
        &self.packet.addr
    }
}

pub(crate) enum TransportEvent {
    /// A packet was received from a transport.
    Packet {
        transport: Arc<dyn Transport>,
        packet: Packet,
    },
    /// A new transport was created.
    Created(Arc<dyn Transport>),
    /// A connection oriented transport was closed.
    Closed(Arc<dyn Transport>),
}

pub(crate) type TransportTx = mpsc::Sender<TransportEvent>;
pub(crate) type TransportRx = mpsc::Receiver<TransportEvent>;

/// Transport registry and inbound pump.
pub struct TransportLayer {
    /// Listening transports, indexed by local address and kind.
    listeners: Mutex<HashMap<TransportKey, Arc<dyn Transport>>>,
    /// Established connections, indexed by kind and both endpoints.
    connections: Mutex<HashMap<ConnectionKey, Arc<dyn Transport>>>,
    /// Sender for transport events.
    transport_tx: TransportTx,
    /// Receiver for transport events, taken by the pump.
    transport_rx: Mutex<Option<TransportRx>>,
}

impl Default for TransportLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportLayer {
    pub(crate) fn new() -> Self {
        let (transport_tx, transport_rx) = mpsc::channel(1_000);
        let transport_rx = Mutex::new(Some(transport_rx));

        Self {
            transport_tx,
            transport_rx,
            listeners: Default::default(),
            connections: Default::default(),
        }
    }

    pub(crate) fn sender(&self) -> &TransportTx {
        &self.transport_tx
    }

    pub(crate) fn transport_count(&self) -> usize {
        self.listeners.lock().expect("Lock failed").len()
            + self.connections.lock().expect("Lock failed").len()
    }

    pub(crate) fn add_transport(&self, transport: Arc<dyn Transport>) {
        match transport.remote() {
            Some(peer) => {
                let key = ConnectionKey {
                    kind: transport.protocol(),
                    peer,
                    local: transport.addr(),
                };
                self.connections.lock().expect("Lock failed").insert(key, transport);
            }
            None => {
                self.listeners
                    .lock()
                    .expect("Lock failed")
                    .insert(transport.key(), transport);
            }
        }
    }

    pub(crate) fn remove_transport(&self, transport: &Arc<dyn Transport>) {
        match transport.remote() {
            Some(peer) => {
                let key = ConnectionKey {
                    kind: transport.protocol(),
                    peer,
                    local: transport.addr(),
                };
                self.connections.lock().expect("Lock failed").remove(&key);
            }
            None => {
                self.listeners.lock().expect("Lock failed").remove(&transport.key());
            }
        }
    }

    /// Drops every registered transport. Their reader tasks end once
    /// the sockets are gone.
    pub(crate) fn clear(&self) {
        self.listeners.lock().expect("Lock failed").clear();
        self.connections.lock().expect("Lock failed").clear();
    }

    /// Finds a transport able to reach `dst` over `kind`.
    ///
    /// Connections are matched on their remote endpoint; listeners on
    /// kind and address family, preferring the least shared one.
    pub fn find(&self, dst: SocketAddr, kind: TransportKind) -> Option<Arc<dyn Transport>> {
        log::debug!("Finding suitable transport={} for={}", kind, dst);

        if kind.is_reliable() {
            let connections = self.connections.lock().expect("Lock failed");
            if let Some(transport) = connections
                .iter()
                .find(|(key, _)| key.kind == kind && key.peer == dst)
                .map(|(_, t)| t.clone())
            {
                return Some(transport);
            }
        }

        let listeners = self.listeners.lock().expect("Lock failed");
        listeners
            .values()
            .filter(|t| t.protocol() == kind && t.is_same_af(&dst))
            .min_by(|a, b| Arc::strong_count(a).cmp(&Arc::strong_count(b)))
            .cloned()
    }

    /// Returns an existing transport for `(kind, dst, local)` or dials a
    /// new one.
    pub(crate) async fn obtain(
        &self,
        kind: TransportKind,
        dst: SocketAddr,
        local: Option<SocketAddr>,
    ) -> Result<Arc<dyn Transport>> {
        if let Some(local) = local {
            let key = ConnectionKey {
                kind,
                peer: dst,
                local,
            };
            let found = self.connections.lock().expect("Lock failed").get(&key).cloned();
            if let Some(transport) = found {
                return Ok(transport);
            }
        }

        if let Some(transport) = self.find(dst, kind) {
            return Ok(transport);
        }

        let sender = self.transport_tx.clone();
        let transport: Arc<dyn Transport> = match kind {
            TransportKind::Udp => udp::UdpTransport::start(local, sender).await?,
            TransportKind::Tcp | TransportKind::Tls => {
                tcp::TcpTransport::connect(dst, local, sender).await?
            }
            TransportKind::Ws | TransportKind::Wss => {
                ws::WsTransport::connect(dst, kind == TransportKind::Wss, sender).await?
            }
        };

        self.add_transport(transport.clone());
        Ok(transport)
    }

    /// Consumes transport events and feeds parsed messages into the
    /// endpoint.
    pub(crate) async fn handle_events(&self, endpoint: &Endpoint) -> Result<()> {
        let rx = self.transport_rx.lock().expect("Lock failed").take();
        let Some(mut rx) = rx else {
            return Ok(());
        };

        while let Some(evt) = rx.recv().await {
            match evt {
                TransportEvent::Packet { transport, packet } => {
                    // Packets are processed in arrival order so dialog
                    // consumers see wire order; long-running work is
                    // spawned further down, never here.
                    if let Err(err) =
                        Self::on_received_packet(transport, packet, endpoint.clone()).await
                    {
                        log::debug!("Failed to handle packet: {}", err);
                    }
                }
                TransportEvent::Created(transport) => {
                    self.add_transport(transport);
                }
                TransportEvent::Closed(transport) => {
                    self.remove_transport(&transport);
                    endpoint.on_transport_closed(&transport).await;
                }
            }
        }

        Ok(())
    }

    async fn on_received_packet(
        transport: Arc<dyn Transport>,
        packet: Packet,
        endpoint: Endpoint,
    ) -> Result<()> {
        let payload = packet.payload.clone();
        let bytes = payload.buf();

        // Keep-alive probe: answer CRLF CRLF with CRLF, drop bare CRLF.
        if bytes == b"\r\n\r\n" {
            transport.send(b"\r\n", &packet.addr).await?;
            return Ok(());
        } else if bytes == b"\r\n" || bytes.is_empty() {
            return Ok(());
        }

        let mut parser = Parser::new(bytes);
        let msg = match parser.parse_sip_msg() {
            Ok(parsed_msg) => parsed_msg,
            Err(err) => {
                log::warn!(
                    "Ignoring {} bytes packet from {} {} : {}\n{}-- end of packet.",
                    bytes.len(),
                    transport.protocol(),
                    packet.addr,
                    err,
                    String::from_utf8_lossy(bytes)
                );

                // Framing on a stream cannot recover from a bad message;
                // the connection is abandoned. Datagrams are just dropped.
                if transport.reliable() {
                    endpoint.transport().remove_transport(&transport);
                    endpoint.on_transport_closed(&transport).await;
                }

                return Err(err);
            }
        };

        let headers = Self::extract_mandatory_headers(&msg, &packet)?;

        match msg {
            SipMsg::Request(request) => {
                let request = IncomingRequest {
                    request,
                    transport,
                    packet,
                    transaction: None,
                    headers,
                };
                endpoint.process_request(request).await
            }
            SipMsg::Response(response) => {
                let response = IncomingResponse {
                    response,
                    transport,
                    packet,
                    transaction: None,
                    headers,
                };
                endpoint.process_response(response).await
            }
        }
    }

    fn extract_mandatory_headers(msg: &SipMsg, packet: &Packet) -> Result<RequestHeaders> {
        let headers = msg.headers();

        let Some(mut via) = headers.top_via().cloned() else {
            return Err(Error::MissingRequiredHeader(Via::NAME));
        };
        let Some(from) = headers.from_hdr().cloned() else {
            return Err(Error::MissingRequiredHeader(FromHdr::NAME));
        };
        let Some(to) = headers.to_hdr().cloned() else {
            return Err(Error::MissingRequiredHeader(To::NAME));
        };
        let Some(call_id) = headers.call_id().cloned() else {
            return Err(Error::MissingRequiredHeader(CallId::NAME));
        };
        let Some(cseq) = headers.cseq().copied() else {
            return Err(Error::MissingRequiredHeader(CSeq::NAME));
        };

        // RFC 3581 section 4: the server MUST stamp the source address
        // into the topmost Via, even when it matches sent-by.
        if msg.is_request() {
            via.set_received(packet.addr.ip());
        }

        Ok(RequestHeaders {
            via,
            from,
            to,
            call_id,
            cseq,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::udp::mock::MockUdpTransport;

    #[test]
    fn test_add_and_find_listener() {
        let transports = TransportLayer::default();
        let addr = "127.0.0.1:8080".parse().unwrap();

        transports.add_transport(Arc::new(MockUdpTransport::new()));

        assert!(transports.find(addr, TransportKind::Udp).is_some());
        assert!(transports.find(addr, TransportKind::Tcp).is_none());
        assert_eq!(transports.transport_count(), 1);
    }

    #[test]
    fn test_remove_transport() {
        let transports = TransportLayer::default();
        let transport: Arc<dyn Transport> = Arc::new(MockUdpTransport::new());
        let addr = "127.0.0.1:8080".parse().unwrap();

        transports.add_transport(transport.clone());
        assert!(transports.find(addr, TransportKind::Udp).is_some());

        transports.remove_transport(&transport);
        assert!(transports.find(addr, TransportKind::Udp).is_none());
        assert_eq!(transports.transport_count(), 0);
    }

    #[test]
    fn test_request_encode_inserts_defaults() {
        use crate::message::{SipMethod, Uri};

        let transport: Arc<dyn Transport> = Arc::new(MockUdpTransport::new());
        let request = OutgoingRequest {
            msg: Request::new(SipMethod::Options, Uri::from_static("sip:bob@b.com").unwrap()),
            addr: transport.addr(),
            transport,
            buf: None,
        };

        let encoded = request.to_bytes().unwrap();
        let text = std::str::from_utf8(&encoded).unwrap();

        assert!(text.starts_with("OPTIONS sip:bob@b.com SIP/2.0\r\n"));
        assert!(text.contains("Max-Forwards: 70\r\n"));
        assert!(text.contains("Content-Length: 0\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_content_length_matches_body() {
        use crate::message::StatusCode;

        let mut response = OutgoingResponse {
            response: Response::new(StatusCode::Ok),
            addr: OutgoingAddr::Addr {
                addr: "127.0.0.1:5060".parse().unwrap(),
                transport: Arc::new(MockUdpTransport::new()),
            },
            buf: None,
        };
        response.set_body(Bytes::from_static(b"v=0"));

        let encoded = response.to_bytes().unwrap();
        let text = std::str::from_utf8(&encoded).unwrap();

        assert!(text.contains("Content-Length: 3\r\n"));
        assert!(text.ends_with("\r\n\r\nv=0"));
    }
}
