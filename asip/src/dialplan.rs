//! Routing of out-of-dialog requests.
//!
//! A [`Dialplan`] resolves `(method, message, transport, addresses)` to
//! a [`Handler`]; the handler runs against an [`IncomingCall`] façade
//! that hides the transaction wiring.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::dialog::Dialog;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::headers::Headers;
use crate::message::{SipMethod, StatusCode, Uri};
use crate::peer::Peer;
use crate::proxy::ProxyDialog;
use crate::transport::IncomingRequest;

/// Resolves an out-of-dialog request to the handler that will serve it.
#[async_trait::async_trait]
pub trait Dialplan: Sync + Send + 'static {
    /// Picks a handler for `request`, or `None` to let the endpoint
    /// answer `501 Not Implemented`.
    ///
    /// The request carries the transport it arrived on and both socket
    /// addresses.
    async fn resolve(
        &self,
        method: SipMethod,
        request: &IncomingRequest,
    ) -> Option<Arc<dyn Handler>>;
}

/// The application logic serving one out-of-dialog request.
#[async_trait::async_trait]
pub trait Handler: Sync + Send + 'static {
    /// Serves the call.
    ///
    /// An error (and a panic, in debug mode with the text attached)
    /// becomes a `500` towards the caller.
    async fn call(&self, call: IncomingCall) -> Result<()>;
}

/// A per-method route map with an optional fallback.
///
/// ```
/// use asip::dialplan::Router;
/// let router = Router::new();
/// assert!(router.is_empty());
/// ```
#[derive(Default)]
pub struct Router {
    routes: HashMap<SipMethod, Arc<dyn Handler>>,
    fallback: Option<Arc<dyn Handler>>,
}

impl Router {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` when no routes are registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty() && self.fallback.is_none()
    }

    /// Routes `method` to `handler`.
    pub fn route(mut self, method: SipMethod, handler: impl Handler) -> Self {
        self.routes.insert(method, Arc::new(handler));
        self
    }

    /// Serves every unrouted method with `handler`.
    pub fn fallback(mut self, handler: impl Handler) -> Self {
        self.fallback = Some(Arc::new(handler));
        self
    }
}

#[async_trait::async_trait]
impl Dialplan for Router {
    async fn resolve(
        &self,
        method: SipMethod,
        _request: &IncomingRequest,
    ) -> Option<Arc<dyn Handler>> {
        self.routes
            .get(&method)
            .or(self.fallback.as_ref())
            .cloned()
    }
}

/// One out-of-dialog request, ready to be served.
///
/// Wraps the request, the peer it came from and the server transaction
/// the endpoint opened for it.
pub struct IncomingCall {
    endpoint: Endpoint,
    peer: Peer,
    request: IncomingRequest,
}

impl IncomingCall {
    pub(crate) fn new(endpoint: Endpoint, peer: Peer, request: IncomingRequest) -> Self {
        Self {
            endpoint,
            peer,
            request,
        }
    }

    /// The request being served.
    pub fn request(&self) -> &IncomingRequest {
        &self.request
    }

    /// The method of the request.
    pub fn method(&self) -> SipMethod {
        self.request.method()
    }

    /// The peer the request arrived from.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// The endpoint serving the request.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Replies without opening a dialog.
    pub async fn reply(
        &self,
        code: StatusCode,
        headers: Option<Headers>,
        body: Option<Bytes>,
    ) -> Result<()> {
        let mut response = self.request.new_response(code);
        if let Some(mut headers) = headers {
            response.append_headers(&mut headers);
        }
        if let Some(body) = body {
            response.set_body(body);
        }

        match self.request.transaction() {
            Some(tsx) => tsx.respond(&mut response).await,
            None => self.endpoint.send_response(&mut response).await,
        }
    }

    /// Accepts the request into a new UAS dialog, answering `code`.
    ///
    /// The dialog receives the follow-up in-dialog requests through
    /// [`Dialog::recv`].
    pub async fn prepare(&self, code: StatusCode, headers: Option<Headers>) -> Result<Dialog> {
        let local_tag = self
            .request
            .headers
            .via
            .branch()
            .map(|branch| crate::tag_from_branch(branch))
            .unwrap_or_else(crate::gen_tag);

        let dialog = Dialog::new_uas(&self.endpoint, &self.peer, &self.request, local_tag)?;

        if let Some(tsx) = self.request.transaction() {
            tsx.set_dialog(dialog.clone());
        }

        dialog.reply(&self.request, code, headers, None).await?;
        Ok(dialog)
    }

    /// Forwards the request to `target` and wires the reverse path, per
    /// stateless proxy rules (push our Via out, pop it on the way back).
    pub async fn proxy(&self, target: &Uri) -> Result<ProxyDialog> {
        let kind = self.request.transport.protocol();
        let port = target.port_or_default();

        let ip = match &target.host_port.host {
            crate::message::Host::IpAddr(ip) => *ip,
            crate::message::Host::DomainName(name) => {
                self.endpoint.resolve(name).await.map_err(Error::Io)?
            }
        };

        let addr = std::net::SocketAddr::new(ip, port);
        let downstream = self.endpoint.get_or_create_peer(kind, addr, None).await?;

        let proxy = ProxyDialog::new(self.endpoint.clone(), self.request.clone(), downstream);
        proxy.forward_request().await?;

        Ok(proxy)
    }
}
