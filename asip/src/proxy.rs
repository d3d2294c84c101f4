//! Back-to-back / proxy forwarding.
//!
//! A [`ProxyDialog`] pairs the two legs of a forwarded exchange sharing
//! one Call-ID. On the way out it pushes a fresh Via carrying our
//! address and branch; responses coming back with that branch on top
//! get it popped and travel up the reverse path. Retransmissions bump a
//! counter and re-send the cached bytes without new transactions.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use asip_util::ArcStr;

use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::headers::Header;
use crate::message::Response;
use crate::peer::Peer;
use crate::transport::{
    IncomingRequest, IncomingResponse, OutgoingAddr, OutgoingRequest, OutgoingResponse, ToBytes,
};

struct Inner {
    endpoint: Endpoint,
    /// The leg the original request arrived on.
    upstream: IncomingRequest,
    /// The leg the request is forwarded to.
    downstream: Peer,
    /// The branch stamped on our Via towards downstream.
    branch: ArcStr,
    retransmissions: AtomicU32,
    last_forward: Mutex<Option<Bytes>>,
}

/// A pair of legs forwarding one transaction through this endpoint.
#[derive(Clone)]
pub struct ProxyDialog {
    inner: Arc<Inner>,
}

impl ProxyDialog {
    pub(crate) fn new(endpoint: Endpoint, upstream: IncomingRequest, downstream: Peer) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoint,
                upstream,
                downstream,
                branch: crate::gen_branch(),
                retransmissions: AtomicU32::new(0),
                last_forward: Mutex::new(None),
            }),
        }
    }

    /// The branch of the Via this proxy pushed downstream.
    pub fn branch(&self) -> &ArcStr {
        &self.inner.branch
    }

    /// Number of times the forwarded request was re-sent.
    pub fn retransmissions(&self) -> u32 {
        self.inner.retransmissions.load(Ordering::SeqCst)
    }

    /// Forwards the upstream request downstream, pushing our Via on top
    /// of the stack. Further calls re-send the cached bytes.
    pub async fn forward_request(&self) -> Result<()> {
        let cached = self.inner.last_forward.lock().expect("Lock failed").clone();
        if let Some(buf) = cached {
            self.inner.retransmissions.fetch_add(1, Ordering::SeqCst);
            return self.inner.downstream.send_raw(&buf).await;
        }

        let mut msg = self.inner.upstream.request.clone();
        let via = self.inner.downstream.generate_via(self.inner.branch.clone());
        msg.headers.push_front(Header::Via(via));

        let out = OutgoingRequest {
            addr: self.inner.downstream.addr(),
            transport: self.inner.downstream.transport().clone(),
            msg,
            buf: None,
        };

        let buf = out.to_bytes()?;
        *self.inner.last_forward.lock().expect("Lock failed") = Some(buf.clone());

        log::debug!(
            "Proxying {} to /{}",
            self.inner.upstream.method(),
            self.inner.downstream.addr()
        );

        self.inner.endpoint.register_proxy(self.clone());
        self.inner.downstream.send_raw(&buf).await
    }

    /// Sends a downstream response up the reverse path: our Via comes
    /// off the top, the rest of the message travels untouched.
    pub(crate) async fn forward_response(&self, response: &IncomingResponse) -> Result<()> {
        let mut msg: Response = response.response.clone();
        msg.headers.take_first(|h| matches!(h, Header::Via(_)));

        log::debug!(
            "Proxying response {} back to /{}",
            msg.code().as_u16(),
            self.inner.upstream.packet.addr
        );

        let mut out = OutgoingResponse {
            response: msg,
            addr: OutgoingAddr::Addr {
                addr: self.inner.upstream.packet.addr,
                transport: self.inner.upstream.transport.clone(),
            },
            buf: None,
        };

        let result = match self.inner.upstream.transaction() {
            Some(tsx) => tsx.respond(&mut out).await,
            None => self.inner.endpoint.send_response(&mut out).await,
        };

        if response.code().is_final() {
            self.inner.endpoint.remove_proxy(&self.inner.branch);
        }

        result
    }
}
