//! Codec trait and the JSON implementation used on the relay socket.
//!
//! The relay and the WebSocket client never touch `serde_json` directly:
//! they hold something that implements [`Codec`]. Swapping JSON for a
//! binary format later means adding one more impl, not editing handlers.

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// A codec that can encode Rust types to bytes and decode bytes back.
///
/// `Send + Sync + 'static` because a codec lives inside long-running
/// Tokio tasks (the relay's connection handlers, the client's reader).
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if serialization fails.
    fn encode<T: Serialize>(
        &self,
        value: &T,
    ) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed or don't
    /// match the expected type.
    fn decode<T: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> Result<T, ProtocolError>;
}

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// JSON keeps relay traffic readable in browser DevTools, which matters
/// more than frame size for cursor-sized payloads.
///
/// ```rust
/// use tether_protocol::{ClientFrame, Codec, Envelope, JsonCodec, SpaceId};
///
/// let codec = JsonCodec;
/// let envelope = Envelope {
///     seq: 1,
///     timestamp: 5000,
///     payload: ClientFrame::Leave { space: SpaceId::workspace("w1").unwrap() },
/// };
///
/// let bytes = codec.encode(&envelope).unwrap();
/// let decoded: Envelope<ClientFrame> = codec.decode(&bytes).unwrap();
/// assert_eq!(envelope, decoded);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(
        &self,
        value: &T,
    ) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}
