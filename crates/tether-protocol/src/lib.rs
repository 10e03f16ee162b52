//! Wire protocol for Tether.
//!
//! This crate defines the vocabulary every other layer speaks:
//!
//! - **Identity** ([`SpaceId`], [`ClientId`], [`ConnectionId`],
//!   [`MemberKey`]): what a Space is called and who is in it.
//! - **Events** ([`SpaceMember`], [`LocationUpdate`], [`SpaceEvent`]):
//!   the membership and location notifications a transport delivers.
//! - **Frames** ([`Envelope`], [`ClientFrame`], [`RelayFrame`]): what
//!   travels between a WebSocket client and the relay.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how frames become bytes.
//!
//! # Architecture
//!
//! The protocol layer knows nothing about connections or actors. It only
//! describes data and how to serialize it.
//!
//! ```text
//! Transport (frames) → Protocol (SpaceEvent) → Space (member list)
//! ```

mod codec;
mod error;
mod frame;
mod types;

pub use codec::{Codec, JsonCodec};
pub use error::ProtocolError;
pub use frame::{ClientFrame, Envelope, PROTOCOL_VERSION, RelayFrame};
pub use types::{
    ClientId, ConnectionId, EventName, LastEvent, LocationUpdate, MemberKey,
    SpaceEvent, SpaceId, SpaceMember, SubscriptionId, Topic, unix_millis,
};
