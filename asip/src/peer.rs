//! The remote party of one connection.
//!
//! A [`Peer`] wraps a transport plus the remote address it speaks to and
//! is the outbound send target for every dialog. Peers are created and
//! pooled by the endpoint, keyed by `(peer, local)`.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::dialog::{Dialog, DialogSetup};
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::headers::{Contact, Expires, Header, Via};
use crate::message::{Host, HostPort, Response, SipMethod};
use crate::transport::{OutgoingRequest, ToBytes, Transport};

struct Inner {
    addr: SocketAddr,
    transport: Arc<dyn Transport>,
    endpoint: Endpoint,
}

/// A `(transport, peer address, local address)` endpoint.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<Inner>,
}

impl Peer {
    pub(crate) fn new(endpoint: Endpoint, transport: Arc<dyn Transport>, addr: SocketAddr) -> Self {
        Self {
            inner: Arc::new(Inner {
                addr,
                transport,
                endpoint,
            }),
        }
    }

    /// The remote address of this peer.
    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// The local address this peer speaks from.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.transport.addr()
    }

    /// The transport carrying this peer.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// The endpoint owning this peer.
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Builds a Via header for a request sent through this peer.
    pub fn generate_via(&self, branch: asip_util::ArcStr) -> Via {
        Via::new(
            self.inner.transport.via_transport(),
            self.local_host_port(),
            Some(branch),
        )
    }

    /// The local address as a Via/Contact host-port.
    pub fn local_host_port(&self) -> HostPort {
        HostPort::from(self.local_addr())
    }

    /// The default Contact advertised by dialogs on this peer.
    ///
    /// The endpoint's `override_contact_host` wins; an unspecified local
    /// address falls back to an interface address.
    pub fn default_contact(&self, user: Option<&str>) -> Contact {
        let local = self.local_addr();

        let host = match self.inner.endpoint.override_contact_host() {
            Some(host) => Host::from(host.as_str()),
            None if local.ip().is_unspecified() => match local_ip_address::local_ip() {
                Ok(ip) => Host::IpAddr(ip),
                Err(_) => Host::IpAddr(local.ip()),
            },
            None => Host::IpAddr(local.ip()),
        };

        Contact::from_parts(user, host, local.port(), self.inner.transport.via_transport())
    }

    /// Sends a request statelessly (no transaction, no retransmission).
    pub async fn send_request(&self, request: &mut OutgoingRequest) -> Result<()> {
        log::debug!("=> Request {} to /{}", request.method(), self.inner.addr);
        let buf = match request.buf.take() {
            Some(buf) => buf,
            None => request.to_bytes()?,
        };
        self.inner.transport.send(&buf, &self.inner.addr).await?;
        Ok(())
    }

    /// Writes already encoded bytes to the peer.
    pub(crate) async fn send_raw(&self, buf: &[u8]) -> Result<()> {
        self.inner.transport.send(buf, &self.inner.addr).await?;
        Ok(())
    }

    /// Opens a fresh outbound dialog on this peer without sending
    /// anything yet.
    pub fn create_dialog(&self, method: SipMethod, setup: DialogSetup) -> Dialog {
        Dialog::new_uac(&self.inner.endpoint, self, method, setup)
    }

    /// Opens a dialog with `method` and awaits the final response of its
    /// opening request.
    pub async fn request(
        &self,
        method: SipMethod,
        mut setup: DialogSetup,
    ) -> Result<(Dialog, Response)> {
        let headers = std::mem::take(&mut setup.headers);
        let body = setup.body.take();

        let dialog = self.create_dialog(method, setup);
        match dialog.request(method, Some(headers), body, None).await {
            Ok(response) => Ok((dialog, response)),
            Err(err) => {
                let _ = dialog.close().await;
                Err(err)
            }
        }
    }

    /// Subscribes at the remote side; the returned dialog receives the
    /// NOTIFYs.
    pub async fn subscribe(
        &self,
        mut setup: DialogSetup,
        expires: u32,
    ) -> Result<(Dialog, Response)> {
        setup.headers.push(Header::Expires(Expires::new(expires)));
        self.request(SipMethod::Subscribe, setup).await
    }

    /// Registers at the remote side.
    pub async fn register(
        &self,
        mut setup: DialogSetup,
        expires: u32,
    ) -> Result<(Dialog, Response)> {
        setup.headers.push(Header::Expires(Expires::new(expires)));
        self.request(SipMethod::Register, setup).await
    }

    /// Starts a call. The INVITE is driven in the background; await
    /// [`Dialog::ready`] for the outcome.
    pub async fn invite(&self, mut setup: DialogSetup) -> Result<Dialog> {
        let headers = std::mem::take(&mut setup.headers);
        let body = setup.body.take();

        let dialog = self.create_dialog(SipMethod::Invite, setup);

        let invite = dialog.clone();
        tokio::spawn(async move {
            if let Err(err) = invite
                .request(SipMethod::Invite, Some(headers), body, None)
                .await
            {
                log::debug!("INVITE on {} failed: {}", invite.id(), err);
                invite.fail_waiter(err);
            }
        });

        Ok(dialog)
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<Peer {} {}, local_addr={}>",
            self.inner.addr,
            self.inner.transport.protocol(),
            self.local_addr()
        )
    }
}
