//! SIP WebSocket transport (RFC 7118).
//!
//! Each text or binary frame carries exactly one SIP message; the
//! `sip` subprotocol is negotiated on both the client and server side.

use std::borrow::Cow;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{
    Request as WsRequest, Response as WsResponse,
};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, connect_async, MaybeTlsStream, WebSocketStream};

use super::{Packet, Payload, Transport, TransportEvent, TransportTx};
use crate::error::{Error, Result};
use crate::message::TransportKind;

/// The WebSocket subprotocol token SIP rides on.
pub const SIP_SUBPROTOCOL: &str = "sip";

const SEC_WEBSOCKET_PROTOCOL: &str = "Sec-WebSocket-Protocol";

fn ws_err(err: tokio_tungstenite::tungstenite::Error) -> Error {
    Error::Io(io::Error::other(err))
}

struct Inner<S> {
    addr: SocketAddr,
    remote_addr: SocketAddr,
    secure: bool,
    local_name: String,
    write: Mutex<SplitSink<WebSocketStream<S>, Message>>,
}

/// WebSocket transport implementation, one per connection.
pub struct WsTransport<S>(Arc<Inner<S>>);

impl<S> Clone for WsTransport<S> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl WsTransport<MaybeTlsStream<TcpStream>> {
    /// Dials `ws://dst` (or `wss://dst` when `secure`), negotiating the
    /// `sip` subprotocol, and starts the connection's read task.
    pub(crate) async fn connect(
        dst: SocketAddr,
        secure: bool,
        sender: TransportTx,
    ) -> Result<Arc<dyn Transport>> {
        let scheme = if secure { "wss" } else { "ws" };
        let url = format!("{}://{}", scheme, dst);

        let mut request = url.into_client_request().map_err(ws_err)?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SIP_SUBPROTOCOL));

        let (stream, _response) = connect_async(request).await.map_err(ws_err)?;

        let addr = match stream.get_ref() {
            MaybeTlsStream::Plain(tcp) => tcp.local_addr()?,
            _ => SocketAddr::from(([0, 0, 0, 0], 0)),
        };

        let transport = WsTransport::started(stream, addr, dst, secure, sender.clone());
        sender
            .send(TransportEvent::Created(transport.clone()))
            .await?;

        Ok(transport)
    }
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn started(
        stream: WebSocketStream<S>,
        addr: SocketAddr,
        remote_addr: SocketAddr,
        secure: bool,
        sender: TransportTx,
    ) -> Arc<dyn Transport> {
        let (write, read) = stream.split();

        let ws = WsTransport(Arc::new(Inner {
            addr,
            remote_addr,
            secure,
            local_name: crate::get_local_name(&addr),
            write: Mutex::new(write),
        }));
        let transport: Arc<dyn Transport> = Arc::new(ws);

        tokio::spawn(Self::read_loop(read, transport.clone(), sender));

        transport
    }

    async fn read_loop(
        mut read: SplitStream<WebSocketStream<S>>,
        transport: Arc<dyn Transport>,
        sender: TransportTx,
    ) -> Result<()> {
        let remote = transport.remote().expect("WS transport has a remote");

        while let Some(frame) = read.next().await {
            match frame {
                Ok(msg) if msg.is_text() || msg.is_binary() => {
                    let packet = Packet {
                        payload: Payload::new(msg.into_data()),
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
                Ok(Message::Close(_)) => break,
                Ok(_) => (),
                Err(err) => {
                    log::warn!("WebSocket connection to {} failed: {}", remote, err);
                    break;
                }
            }
        }

        sender.send(TransportEvent::Closed(transport.clone())).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, buf: &[u8], _: &SocketAddr) -> Result<usize> {
        let message = Message::Binary(buf.to_vec().into());

        let mut writer = self.0.write.lock().await;
        writer.send(message).await.map_err(ws_err)?;

        Ok(buf.len())
    }

    fn protocol(&self) -> TransportKind {
        if self.0.secure {
            TransportKind::Wss
        } else {
            TransportKind::Ws
        }
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
        self.0.secure
    }
}

/// A WebSocket server accepting inbound SIP connections.
pub struct WsServer;

impl WsServer {
    /// Binds `addr` and spawns the accept loop, returning the bound
    /// address. Each upgraded stream becomes its own [`WsTransport`].
    pub(crate) async fn start(addr: SocketAddr, sender: TransportTx) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;

        log::debug!(
            "SIP {} transport started, listening on {}",
            TransportKind::Ws,
            local
        );

        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        log::warn!("WebSocket accept failed: {}", err);
                        break;
                    }
                };

                let sender = sender.clone();
                tokio::spawn(async move {
                    let callback = |_req: &WsRequest, mut resp: WsResponse| {
                        resp.headers_mut().insert(
                            SEC_WEBSOCKET_PROTOCOL,
                            HeaderValue::from_static(SIP_SUBPROTOCOL),
                        );
                        Ok(resp)
                    };

                    match accept_hdr_async(stream, callback).await {
                        Ok(ws) => {
                            log::debug!("Accepted WebSocket connection from {}", peer);
                            let transport =
                                WsTransport::started(ws, local, peer, false, sender.clone());
                            let _ = sender.send(TransportEvent::Created(transport)).await;
                        }
                        Err(err) => {
                            log::warn!("WebSocket handshake with {} failed: {}", peer, err);
                        }
                    }
                });
            }
        });

        Ok(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    const MSG: &[u8] =
        b"OPTIONS sip:host SIP/2.0\r\nCSeq: 1 OPTIONS\r\nContent-Length: 0\r\n\r\n";

    #[tokio::test]
    async fn test_ws_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (server_tx, mut server_rx) = mpsc::channel(8);
        let (client_tx, mut client_rx) = mpsc::channel(8);

        // Minimal in-test accept: one upgrade, then frames as packets.
        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let ws = accept_hdr_async(stream, |_req: &WsRequest, mut resp: WsResponse| {
                resp.headers_mut().insert(
                    SEC_WEBSOCKET_PROTOCOL,
                    HeaderValue::from_static(SIP_SUBPROTOCOL),
                );
                Ok(resp)
            })
            .await
            .unwrap();
            let _ = WsTransport::started(ws, addr, peer, false, server_tx);
            // Keep the accept task alive until the test ends.
            std::future::pending::<()>().await;
        });

        let client = WsTransport::connect(addr, false, client_tx).await.unwrap();
        assert_eq!(client.protocol(), TransportKind::Ws);
        assert!(matches!(
            client_rx.recv().await.unwrap(),
            TransportEvent::Created(_)
        ));

        client.send(MSG, &addr).await.unwrap();

        let TransportEvent::Packet { packet, .. } = server_rx.recv().await.unwrap() else {
            panic!("expected a packet event");
        };
        assert_eq!(packet.payload.buf(), MSG);
    }
}
