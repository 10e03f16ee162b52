//! Error types for the auth layer.

use tether_protocol::ClientId;

/// Errors raised while acquiring or checking a credential.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The token endpoint refused to issue a credential (not logged in,
    /// forbidden, ...).
    #[error("credential request rejected: {0}")]
    Rejected(String),

    /// The token endpoint could not be reached at all.
    #[error("token endpoint unavailable: {0}")]
    Unavailable(String),

    /// The presented token was never issued, or has been revoked.
    #[error("invalid token")]
    InvalidToken,

    /// The presented token is past its TTL.
    #[error("token expired for client {0}")]
    Expired(ClientId),
}
