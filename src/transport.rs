#![expect(
    clippy::module_name_repetitions,
    reason = "Transport types expose their domain in the name for clarity"
)]

//! Transport abstraction underneath the connection manager.
//!
//! The manager never names a concrete socket type: it dials through a
//! [`Connector`] and drives whatever [`Transport`] the connector produces.
//! Production code uses [`WsConnector`] (tokio-tungstenite); tests inject
//! scripted transports to exercise reconnection and heartbeat behavior
//! without real sockets.

use async_trait::async_trait;
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::Result;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A single inbound notification from the transport.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A complete text frame
    Text(String),
    /// The peer closed the connection
    Closed {
        /// Close code supplied by the peer, if any
        code: Option<u16>,
        /// Close reason supplied by the peer, if any
        reason: Option<String>,
    },
}

/// One live full-duplex text connection.
///
/// `next` must be cancel-safe: dropping its future between polls must not
/// lose a frame. Both tungstenite streams and channel-backed test doubles
/// satisfy this.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Transmit one text frame.
    async fn send(&mut self, text: String) -> Result<()>;

    /// Wait for the next inbound notification. `None` means the stream is
    /// exhausted and no close frame was observed.
    async fn next(&mut self) -> Option<Result<TransportEvent>>;

    /// Close the connection. Safe to call at any point in the lifecycle.
    async fn close(&mut self) -> Result<()>;
}

/// Factory that dials an endpoint and yields an open [`Transport`].
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The transport type produced by this connector.
    type Transport: Transport;

    /// Dial the endpoint. Resolving `Ok` means the connection is open.
    async fn connect(&self, endpoint: &str) -> Result<Self::Transport>;
}

/// Default [`Connector`] backed by tokio-tungstenite.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

/// [`Transport`] over a tokio-tungstenite WebSocket stream.
pub struct WsTransport {
    stream: WsStream,
}

#[async_trait]
impl Connector for WsConnector {
    type Transport = WsTransport;

    async fn connect(&self, endpoint: &str) -> Result<WsTransport> {
        let (stream, _) = connect_async(endpoint).await?;
        Ok(WsTransport { stream })
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.stream.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn next(&mut self) -> Option<Result<TransportEvent>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(TransportEvent::Text(text.to_string()))),
                Ok(Message::Close(frame)) => {
                    let (code, reason) = frame
                        .map(|f| (Some(u16::from(f.code)), Some(f.reason.to_string())))
                        .unwrap_or((None, None));
                    return Some(Ok(TransportEvent::Closed { code, reason }));
                }
                Ok(_) => {
                    // Binary frames and protocol-level ping/pong are not part
                    // of this protocol's surface.
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self.stream.close(None).await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
