//! Server side of the WebSocket transport, using `tokio-tungstenite`.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use crate::TransportError;

/// Counter for generating unique peer IDs.
static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

type WsStream = WebSocketStream<TcpStream>;

/// Opaque identifier for an accepted socket, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(u64);

impl PeerId {
    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Accepts incoming WebSocket connections.
pub struct WebSocketListener {
    listener: TcpListener,
}

impl WebSocketListener {
    /// Binds to `addr` (`"127.0.0.1:0"` picks a free port).
    ///
    /// # Errors
    /// [`TransportError::AcceptFailed`] if the address cannot be bound.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::info!(addr, "WebSocket listener bound");
        Ok(Self { listener })
    }

    /// The address actually bound.
    ///
    /// # Errors
    /// [`TransportError::AcceptFailed`] if the OS cannot report it.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener
            .local_addr()
            .map_err(TransportError::AcceptFailed)
    }

    /// Waits for the next client and completes the WebSocket handshake.
    ///
    /// # Errors
    /// [`TransportError::AcceptFailed`] if the TCP accept or the handshake
    /// fails. The listener stays usable.
    pub async fn accept(&self) -> Result<WebSocketPeer, TransportError> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;

        let ws = tokio_tungstenite::accept_async(stream).await.map_err(|e| {
            TransportError::AcceptFailed(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                e,
            ))
        })?;

        let id = PeerId(NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(%id, %addr, "accepted WebSocket connection");

        let (sink, stream) = ws.split();
        Ok(WebSocketPeer {
            id,
            addr,
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        })
    }
}

/// One accepted WebSocket connection.
///
/// The write and read halves are locked separately, so a task blocked in
/// [`recv`](Self::recv) never holds up [`send`](Self::send).
pub struct WebSocketPeer {
    id: PeerId,
    addr: SocketAddr,
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
}

impl WebSocketPeer {
    /// Sends one text frame.
    ///
    /// # Errors
    /// [`TransportError::SendFailed`] if the socket is gone.
    pub async fn send(&self, text: String) -> Result<(), TransportError> {
        self.sink
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| {
                TransportError::SendFailed(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    e,
                ))
            })
    }

    /// Receives the next data frame, text or binary, as bytes.
    ///
    /// Returns `Ok(None)` when the connection is cleanly closed.
    ///
    /// # Errors
    /// [`TransportError::ReceiveFailed`] on a protocol or socket error.
    pub async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(data.into())),
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(text.as_bytes().to_vec()));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue, // ping/pong/raw frame
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        e,
                    )));
                }
            }
        }
    }

    /// Sends a close frame.
    ///
    /// # Errors
    /// [`TransportError::SendFailed`] if the socket is already gone.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.sink.lock().await.close().await.map_err(|e| {
            TransportError::SendFailed(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                e,
            ))
        })
    }

    /// This peer's log identifier.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// The remote address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl fmt::Debug for WebSocketPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketPeer")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}
