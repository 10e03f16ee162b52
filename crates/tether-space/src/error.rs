//! Error types for the Space layer.

use tether_protocol::SpaceId;
use tether_transport::TransportError;

/// Errors that can occur during Space operations.
#[derive(Debug, thiserror::Error)]
pub enum SpaceError {
    /// The transport could not materialize the Space.
    #[error("could not resolve space {space}: {source}")]
    Resolve {
        space: SpaceId,
        #[source]
        source: TransportError,
    },

    /// The shared realtime connection could not be established.
    #[error("realtime connection unavailable: {0}")]
    Connection(#[source] TransportError),

    /// A transport call made on behalf of the Space failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// `enter` was called while a `leave` is still tearing down.
    #[error("space {0} is still leaving")]
    Leaving(SpaceId),

    /// A `leave` arrived before the pending `enter` completed.
    #[error("entering space {0} was aborted by leave")]
    EnterAborted(SpaceId),

    /// The member snapshot could not be fetched, so the entry was rolled
    /// back.
    #[error("member snapshot for space {space} failed: {reason}")]
    Snapshot { space: SpaceId, reason: String },

    /// The operation needs the session to be entering or entered.
    #[error("not entered in space {0}")]
    NotEntered(SpaceId),

    /// A location payload could not be serialized.
    #[error("location payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// The Space is in a state that doesn't allow this operation.
    #[error("invalid space state for this operation: {0}")]
    InvalidState(String),

    /// The Space's command channel is full or closed.
    #[error("space {0} is unavailable")]
    Unavailable(SpaceId),
}
