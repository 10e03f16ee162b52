//! Unified error type for Tether.

use tether_auth::AuthError;
use tether_protocol::ProtocolError;
use tether_space::SpaceError;
use tether_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `tether` crate you deal with this single error type
/// instead of importing errors from each layer. The `#[from]` attribute on
/// each variant lets `?` convert layer errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    /// A transport-level error (connect, send, recv, rejected request).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode, malformed Space id).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A credential could not be obtained or was refused.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// A Space-level error (leaving, not entered, aborted entry).
    #[error(transparent)]
    Space(#[from] SpaceError),
}

#[cfg(test)]
mod tests {
    use tether_protocol::{ClientId, SpaceId};

    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ConnectionClosed("gone".into());
        let tether_err: TetherError = err.into();
        assert!(matches!(tether_err, TetherError::Transport(_)));
        assert!(tether_err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_protocol_error() {
        let err = SpaceId::workspace("").unwrap_err();
        let tether_err: TetherError = err.into();
        assert!(matches!(tether_err, TetherError::Protocol(_)));
    }

    #[test]
    fn test_from_auth_error() {
        let err = AuthError::Expired(ClientId::new("u1"));
        let tether_err: TetherError = err.into();
        assert!(matches!(tether_err, TetherError::Auth(_)));
        assert!(tether_err.to_string().contains("u1"));
    }

    #[test]
    fn test_from_space_error() {
        let err = SpaceError::Leaving(SpaceId::workspace("w1").unwrap());
        let tether_err: TetherError = err.into();
        assert!(matches!(tether_err, TetherError::Space(_)));
    }
}
