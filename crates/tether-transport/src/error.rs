use tether_auth::AuthError;
use tether_protocol::{ProtocolError, SpaceId};

/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The credential could not be obtained or was refused.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// An operation needed a connected transport and there was none.
    #[error("transport is not connected")]
    NotConnected,

    /// Opening the underlying socket failed.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The connection was closed underneath a pending operation.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Sending data failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Receiving data failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// Binding or accepting connections failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The remote side refused a request.
    #[error("request rejected ({code}): {message}")]
    Rejected { code: u16, message: String },

    /// The operation requires this connection to be entered in the Space.
    #[error("not entered in space {0}")]
    NotEntered(SpaceId),

    /// No reply arrived within the request timeout.
    #[error("request timed out")]
    Timeout,
}
