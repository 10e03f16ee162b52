//! Error types for the protocol layer.
//!
//! Each crate in Tether defines its own error enum. A `ProtocolError`
//! always means the problem is in naming or (de)serialization, never in
//! networking or membership bookkeeping.

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust type into bytes).
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed (turning bytes into a Rust type).
    ///
    /// Common causes: malformed JSON, missing required fields, or a frame
    /// `type` tag this build does not know.
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// A space identifier could not be built or parsed.
    ///
    /// Raised for empty ids, ids containing the `|` separator, and strings
    /// that are not of the form `workspace:<id>[|database:<id>]`.
    #[error("invalid space id: {0}")]
    InvalidSpaceId(String),

    /// The message is invalid at the protocol level.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
