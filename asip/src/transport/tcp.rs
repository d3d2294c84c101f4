//! SIP TCP transport.
//!
//! Connection oriented: each accepted or dialed stream becomes its own
//! transport with a persistent receive buffer. A lost connection emits a
//! `Closed` event that invalidates the dialogs and transactions tied to
//! its peer.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::io::{split, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;

use super::{Packet, StreamingDecoder, Transport, TransportEvent, TransportTx};
use crate::error::Result;
use crate::message::TransportKind;

type TcpRead = FramedRead<ReadHalf<TcpStream>, StreamingDecoder>;
type TcpWrite = Mutex<WriteHalf<TcpStream>>;

struct Inner {
    addr: SocketAddr,
    remote_addr: SocketAddr,
    local_name: String,
    write: TcpWrite,
}

/// TCP transport implementation, one per connection.
#[derive(Clone)]
pub struct TcpTransport(Arc<Inner>);

impl TcpTransport {
    /// Dials `dst`, optionally binding the local side first, and starts
    /// the connection's read task.
    pub(crate) async fn connect(
        dst: SocketAddr,
        local: Option<SocketAddr>,
        sender: TransportTx,
    ) -> Result<Arc<dyn Transport>> {
        let stream = match local {
            Some(local) => {
                let sock = if local.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                sock.bind(local)?;
                sock.connect(dst).await?
            }
            None => TcpStream::connect(dst).await?,
        };

        let transport = Self::from_stream(stream, sender.clone())?;
        sender
            .send(TransportEvent::Created(transport.clone()))
            .await?;

        Ok(transport)
    }

    /// Wraps an established stream and spawns its read task.
    pub(crate) fn from_stream(stream: TcpStream, sender: TransportTx) -> Result<Arc<dyn Transport>> {
        let addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        let local_name = crate::get_local_name(&addr);

        let (read, write) = split(stream);

        let tcp = TcpTransport(Arc::new(Inner {
            addr,
            remote_addr,
            local_name,
            write: Mutex::new(write),
        }));
        let transport: Arc<dyn Transport> = Arc::new(tcp);

        let reader = FramedRead::new(read, StreamingDecoder);
        tokio::spawn(Self::read_loop(reader, transport.clone(), sender));

        Ok(transport)
    }

    async fn read_loop(
        mut reader: TcpRead,
        transport: Arc<dyn Transport>,
        sender: TransportTx,
    ) -> Result<()> {
        let remote = transport.remote().expect("TCP transport has a remote");

        loop {
            match reader.next().await {
                Some(Ok(payload)) => {
                    let packet = Packet {
                        payload,
                        addr: remote,
                        time: SystemTime::now(),
                    };
                    sender
                        .send(TransportEvent::Packet {
                            transport: transport.clone(),
                            packet,
                        })
                        .await?;
                }
                Some(Err(err)) => {
                    log::warn!("TCP connection to {} failed: {}", remote, err);
                    sender.send(TransportEvent::Closed(transport.clone())).await?;
                    break;
                }
                None => {
                    log::debug!("TCP connection to {} closed by peer", remote);
                    sender.send(TransportEvent::Closed(transport.clone())).await?;
                    break;
                }
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&self, buf: &[u8], _: &SocketAddr) -> Result<usize> {
        let mut writer = self.0.write.lock().await;

        writer.write_all(buf).await?;
        writer.flush().await?;

        Ok(buf.len())
    }

    fn protocol(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn addr(&self) -> SocketAddr {
        self.0.addr
    }

    fn remote(&self) -> Option<SocketAddr> {
        Some(self.0.remote_addr)
    }

    fn local_name(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.0.local_name)
    }

    fn reliable(&self) -> bool {
        true
    }

    fn secure(&self) -> bool {
        false
    }
}

/// A TCP server accepting inbound SIP connections.
pub struct TcpServer;

impl TcpServer {
    /// Binds `addr` and spawns the accept loop, returning the bound
    /// address. Each accepted stream becomes its own [`TcpTransport`].
    pub(crate) async fn start(addr: SocketAddr, sender: TransportTx) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;

        log::debug!(
            "SIP {} transport started, listening on {}",
            TransportKind::Tcp,
            local
        );

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        log::debug!("Accepted TCP connection from {}", peer);
                        match TcpTransport::from_stream(stream, sender.clone()) {
                            Ok(transport) => {
                                if sender
                                    .send(TransportEvent::Created(transport))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Err(err) => {
                                log::warn!("Failed to set up TCP connection: {}", err);
                            }
                        }
                    }
                    Err(err) => {
                        log::warn!("TCP accept failed: {}", err);
                        break;
                    }
                }
            }
        });

        Ok(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    const MSG: &[u8] =
        b"OPTIONS sip:host SIP/2.0\r\nCSeq: 1 OPTIONS\r\nContent-Length: 0\r\n\r\n";

    #[tokio::test]
    async fn test_framed_receive_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(8);

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let _transport = TcpTransport::from_stream(stream, tx).unwrap();

        // Two messages in one write must come out as two packets.
        let mut joined = MSG.to_vec();
        joined.extend_from_slice(MSG);
        client.write_all(&joined).await.unwrap();

        for _ in 0..2 {
            let TransportEvent::Packet { packet, .. } = rx.recv().await.unwrap() else {
                panic!("expected a packet event");
            };
            assert_eq!(packet.payload.buf(), MSG);
        }

        // Dropping the client closes the connection.
        drop(client);
        assert!(matches!(
            rx.recv().await.unwrap(),
            TransportEvent::Closed(_)
        ));
    }

    #[tokio::test]
    async fn test_send_writes_to_stream() {
        use tokio::io::AsyncReadExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, _rx) = mpsc::channel(8);

        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let transport = TcpTransport::from_stream(stream, tx).unwrap();

        transport.send(MSG, &addr).await.unwrap();

        let mut buf = vec![0u8; MSG.len()];
        let mut client = client;
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, MSG);
    }
}
