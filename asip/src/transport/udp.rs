//! SIP UDP transport.
//!
//! One socket per local address; connectionless, one datagram is one
//! message.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::net::{ToSocketAddrs, UdpSocket};

use super::{Packet, Payload, Transport, TransportEvent, TransportTx};
use crate::error::Result;
use crate::message::TransportKind;

struct Inner {
    sock: UdpSocket,
    addr: SocketAddr,
    local_name: String,
}

/// UDP transport implementation.
#[derive(Clone)]
pub struct UdpTransport(Arc<Inner>);

impl UdpTransport {
    /// Binds a UDP transport to the specified address.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let sock = UdpSocket::bind(addr).await?;
        let addr = sock.local_addr()?;
        let local_name = crate::get_local_name(&addr);

        Ok(Self(Arc::new(Inner {
            sock,
            addr,
            local_name,
        })))
    }

    /// Binds a socket (ephemeral port when `local` is absent), registers
    /// it with the event pump and starts the receive loop.
    pub(crate) async fn start(
        local: Option<SocketAddr>,
        sender: TransportTx,
    ) -> Result<Arc<dyn Transport>> {
        let addr = local.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        let udp = UdpTransport::bind(addr).await?;

        log::debug!(
            "SIP {} transport started, listening on {}",
            TransportKind::Udp,
            udp.local_name()
        );

        let transport: Arc<dyn Transport> = Arc::new(udp.clone());

        sender
            .send(TransportEvent::Created(transport.clone()))
            .await?;

        tokio::spawn(Self::recv_loop(udp, transport.clone(), sender));

        Ok(transport)
    }

    async fn recv_loop(
        udp: UdpTransport,
        transport: Arc<dyn Transport>,
        sender: TransportTx,
    ) -> Result<()> {
        let mut buf = vec![0u8; 4000];

        loop {
            let (len, addr) = udp.0.sock.recv_from(&mut buf).await?;

            let payload = Payload::new(bytes::Bytes::copy_from_slice(&buf[..len]));
            let packet = Packet {
                payload,
                addr,
                time: SystemTime::now(),
            };

            sender
                .send(TransportEvent::Packet {
                    transport: transport.clone(),
                    packet,
                })
                .await?;
        }
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn send(&self, buf: &[u8], addr: &SocketAddr) -> Result<usize> {
        Ok(self.0.sock.send_to(buf, addr).await?)
    }

    fn protocol(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn addr(&self) -> SocketAddr {
        self.0.addr
    }

    fn local_name(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.0.local_name)
    }

    fn reliable(&self) -> bool {
        false
    }

    fn secure(&self) -> bool {
        false
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A transport that counts what it sends and drops it.
    pub struct MockUdpTransport {
        sent: AtomicUsize,
    }

    impl MockUdpTransport {
        pub fn new() -> Self {
            Self {
                sent: AtomicUsize::new(0),
            }
        }

        pub fn sent_count(&self) -> usize {
            self.sent.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Transport for MockUdpTransport {
        async fn send(&self, buf: &[u8], _addr: &SocketAddr) -> Result<usize> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(buf.len())
        }

        fn protocol(&self) -> TransportKind {
            TransportKind::Udp
        }

        fn addr(&self) -> SocketAddr {
            "127.0.0.1:5060".parse().unwrap()
        }

        fn local_name(&self) -> Cow<'_, str> {
            Cow::Borrowed("127.0.0.1:5060")
        }

        fn reliable(&self) -> bool {
            false
        }

        fn secure(&self) -> bool {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    const MSG_TEST: &[u8] = b"REGISTER sip:registrar.biloxi.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP bobspc.biloxi.com:5060;branch=z9hG4bKnashds7\r\n\
        Max-Forwards: 70\r\n\
        To: Bob <sip:bob@biloxi.com>\r\n\
        From: Bob <sip:bob@biloxi.com>;tag=456248\r\n\
        Call-ID: 843817637684230@998sdasdh09\r\n\
        CSeq: 1826 REGISTER\r\n\
        Contact: <sip:bob@192.0.2.4>\r\n\
        Expires: 7200\r\n\
        Content-Length: 0\r\n\r\n";

    #[tokio::test]
    async fn test_recv_msg() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (tx, mut rx) = mpsc::channel(4);

        let udp = UdpTransport::bind(addr).await.unwrap();
        let client = UdpSocket::bind(addr).await.unwrap();

        let transport: Arc<dyn Transport> = Arc::new(udp.clone());
        tokio::spawn(UdpTransport::recv_loop(udp.clone(), transport, tx));

        client.send_to(MSG_TEST, udp.addr()).await.unwrap();

        let TransportEvent::Packet { packet, .. } = rx.recv().await.unwrap() else {
            unreachable!();
        };

        assert_eq!(packet.payload.buf(), MSG_TEST);
        assert_eq!(packet.addr, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_send_msg() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let udp = UdpTransport::bind(addr).await.unwrap();
        let client = UdpSocket::bind(addr).await.unwrap();

        let client_addr = client.local_addr().unwrap();
        udp.send(MSG_TEST, &client_addr).await.unwrap();

        let mut buf = [0; MSG_TEST.len()];
        let len = client.recv(&mut buf).await.unwrap();

        assert_eq!(len, MSG_TEST.len());
        assert_eq!(&buf[..len], MSG_TEST);
    }
}
