#![deny(missing_docs)]
//! SIP Endpoint builder.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use asip_util::DnsResolver;

use crate::dialog::DialogLayer;
use crate::dialplan::Dialplan;
use crate::endpoint::{Defaults, Endpoint, Inner};
use crate::headers::{Header, Headers};
use crate::message::TransportKind;
use crate::service::SipService;
use crate::transaction::TransactionLayer;
use crate::transport::TransportLayer;

const DEFAULT_USER_AGENT: &str = concat!("asip/", env!("CARGO_PKG_VERSION"));
const DEFAULT_ALLOW: &str = "INVITE, ACK, CANCEL, BYE, OPTIONS, REGISTER, SUBSCRIBE, NOTIFY";

/// Builder for creating a new SIP [`Endpoint`].
///
/// # Examples
///
/// ```
/// # use asip::endpoint;
/// let endpoint = endpoint::Builder::new().with_name("My Endpoint").build();
/// ```
pub struct Builder {
    name: String,
    user_agent: String,
    dialplan: Option<Box<dyn Dialplan>>,
    services: Vec<Box<dyn SipService>>,
    resolver: DnsResolver,
    capabilities: Headers,
    listen: Vec<(TransportKind, SocketAddr)>,
    override_contact_host: Option<String>,
    auth_retries: u32,
    idle_close: Duration,
    debug: bool,
}

impl Builder {
    /// Creates a new default `Builder`.
    pub fn new() -> Self {
        Builder {
            name: String::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            dialplan: None,
            services: vec![],
            resolver: DnsResolver::default(),
            capabilities: Headers::from([Header::other("Allow", DEFAULT_ALLOW)]),
            listen: vec![],
            override_contact_host: None,
            auth_retries: crate::auth::DEFAULT_AUTH_RETRIES,
            idle_close: Duration::from_secs(30),
            debug: false,
        }
    }

    /// Sets the endpoint name.
    pub fn with_name<T: AsRef<str>>(mut self, s: T) -> Self {
        self.name = s.as_ref().to_string();
        self
    }

    /// Sets the User-Agent string for emitted messages.
    pub fn with_user_agent<T: AsRef<str>>(mut self, s: T) -> Self {
        self.user_agent = s.as_ref().to_string();
        self
    }

    /// Sets the dialplan resolving out-of-dialog requests.
    pub fn with_dialplan(mut self, dialplan: impl Dialplan) -> Self {
        self.dialplan = Some(Box::new(dialplan));
        self
    }

    /// Adds a listener for UDP on `addr`.
    pub fn with_udp(mut self, addr: SocketAddr) -> Self {
        self.listen.push((TransportKind::Udp, addr));
        self
    }

    /// Adds a listener for TCP on `addr`.
    pub fn with_tcp(mut self, addr: SocketAddr) -> Self {
        self.listen.push((TransportKind::Tcp, addr));
        self
    }

    /// Adds a WebSocket listener on `addr`.
    pub fn with_ws(mut self, addr: SocketAddr) -> Self {
        self.listen.push((TransportKind::Ws, addr));
        self
    }

    /// Adds a service to the middleware chain.
    ///
    /// Can be called multiple times; a service with an already
    /// registered name is skipped.
    pub fn with_service(mut self, service: impl SipService) -> Self {
        if self.service_exists(service.name()) {
            return self;
        }
        self.services.push(Box::new(service));
        self
    }

    fn service_exists(&self, name: &str) -> bool {
        let exists = self.services.iter().any(|s| s.name() == name);
        if exists {
            log::warn!("Service with name '{}' already exists", name);
        }
        exists
    }

    /// Adds a capability header advertised on default OPTIONS answers.
    pub fn add_capability(mut self, capability: Header) -> Self {
        self.capabilities.push(capability);
        self
    }

    /// Forces the given host into generated Contact headers.
    ///
    /// There is no way to learn the public address of a UDP socket, so
    /// NATed deployments set it explicitly.
    pub fn with_override_contact_host<T: AsRef<str>>(mut self, host: T) -> Self {
        self.override_contact_host = Some(host.as_ref().to_string());
        self
    }

    /// Sets the digest authentication retry budget.
    pub fn with_auth_retries(mut self, retries: u32) -> Self {
        self.auth_retries = retries;
        self
    }

    /// Sets the idle delay after which non-refreshing dialogs close.
    pub fn with_idle_close(mut self, delay: Duration) -> Self {
        self.idle_close = delay;
        self
    }

    /// Attaches error text to generated 500 responses.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Sets the DNS resolver.
    pub fn with_resolver(mut self, resolver: DnsResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Finalizes the builder into an `Endpoint`.
    pub fn build(self) -> Endpoint {
        log::trace!("Creating endpoint...");
        if !self.services.is_empty() {
            log::debug!(
                "Services registered: {}",
                self.services
                    .iter()
                    .map(|s| s.name())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        Endpoint(Arc::new(Inner {
            name: self.name,
            transport: TransportLayer::new(),
            transactions: Arc::new(TransactionLayer::default()),
            dialogs: Arc::new(DialogLayer::default()),
            dialplan: self.dialplan,
            services: self.services.into_boxed_slice(),
            resolver: self.resolver,
            capabilities: self.capabilities,
            defaults: Defaults {
                user_agent: self.user_agent,
                override_contact_host: self.override_contact_host,
                auth_retries: self.auth_retries,
                idle_close: self.idle_close,
                debug: self.debug,
            },
            listen: self.listen,
            peers: Default::default(),
            proxies: Default::default(),
        }))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
