//! Transport layer for Tether.
//!
//! Provides the [`Realtime`] and [`RealtimeSpace`] traits that abstract over
//! a pub/sub service with Space membership, plus the [`Connection`] that
//! owns the one authenticated transport handle of a process.
//!
//! Implementations:
//!
//! - [`Hub`]: the authoritative in-memory pub/sub state (members and
//!   subscribers per Space). Used directly by the loopback client and by
//!   the relay server.
//! - [`LoopbackRealtime`]: an in-process client talking straight to a
//!   [`Hub`].
//! - [`WebSocketRealtime`]: a client speaking the relay frame protocol
//!   over WebSocket, with [`WebSocketListener`] as the server side.
//!
//! # Feature Flags
//!
//! - `websocket` (default): WebSocket client and listener via
//!   `tokio-tungstenite`

mod connection;
mod error;
mod hub;
mod loopback;
#[cfg(feature = "websocket")]
mod client;
#[cfg(feature = "websocket")]
mod websocket;

pub use connection::{Connection, ConnectionState};
pub use error::TransportError;
pub use hub::Hub;
pub use loopback::{LoopbackRealtime, LoopbackSpace};
#[cfg(feature = "websocket")]
pub use client::{ReconnectPolicy, WebSocketRealtime, WebSocketSpace};
#[cfg(feature = "websocket")]
pub use websocket::{PeerId, WebSocketListener, WebSocketPeer};

use std::future::Future;

use serde_json::Value;
use tether_auth::TokenProvider;
use tether_protocol::{
    MemberKey, SpaceEvent, SpaceId, SpaceMember, SubscriptionId, Topic,
};
use tokio::sync::mpsc;

/// One event as a subscriber receives it, tagged with the subscription
/// it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub subscription: SubscriptionId,
    pub event: SpaceEvent,
}

/// Where a subscription delivers its events.
///
/// Several subscriptions may share one sink. Their events then land in it
/// in the order the transport published them, across topics. The
/// transport drops its clone of the sink on unsubscribe, so the receiving
/// end yields `None` once every subscription feeding it is gone.
pub type EventSink = mpsc::UnboundedSender<Delivery>;

/// A live subscription: one topic in one Space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub topic: Topic,
}

/// A realtime pub/sub client.
///
/// Cheap to clone: every clone drives the same underlying connection.
///
/// The futures are declared `Send` so callers can drive them from spawned
/// Tokio tasks (the Space actors do).
pub trait Realtime: Clone + Send + Sync + 'static {
    /// The per-Space handle this transport produces.
    type Space: RealtimeSpace;

    /// Opens the connection, calling `tokens` whenever a credential is
    /// needed. Returns the identity this connection appears as.
    ///
    /// Whether, and how often, a failed credential request is retried is
    /// up to the implementation.
    fn connect<T: TokenProvider>(
        &self,
        tokens: &T,
    ) -> impl Future<Output = Result<MemberKey, TransportError>> + Send;

    /// Materializes the handle for one Space.
    fn space(
        &self,
        id: &SpaceId,
    ) -> impl Future<Output = Result<Self::Space, TransportError>> + Send;

    /// Returns `true` while the connection opened by the last successful
    /// `connect` is up.
    fn is_connected(&self) -> bool;

    /// Resolves once the current connection is lost or closed. Resolves
    /// at once when there is none.
    fn closed(&self) -> impl Future<Output = ()> + Send;

    /// Closes the connection. The transport leaves every Space this
    /// connection was in.
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// One Space as seen through a [`Realtime`] transport.
pub trait RealtimeSpace: Clone + Send + Sync + 'static {
    /// The Space's name.
    fn id(&self) -> &SpaceId;

    /// Enters the Space as this connection, publishing an `enter` event.
    fn enter(
        &self,
        profile_data: Option<Value>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Leaves the Space, publishing a `leave` event.
    fn leave(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Re-publishes this connection's profile data as an `update` event.
    fn update_profile(
        &self,
        profile_data: Option<Value>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// All members currently in the Space, in entry order.
    fn members(
        &self,
    ) -> impl Future<Output = Result<Vec<SpaceMember>, TransportError>> + Send;

    /// This connection's own member record, if entered.
    fn self_member(
        &self,
    ) -> impl Future<Output = Result<Option<SpaceMember>, TransportError>> + Send;

    /// Starts a subscription on one topic, delivering into `sink`.
    fn subscribe(
        &self,
        topic: Topic,
        sink: EventSink,
    ) -> impl Future<Output = Result<Subscription, TransportError>> + Send;

    /// Stops exactly the given subscription.
    fn unsubscribe(
        &self,
        id: SubscriptionId,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Publishes this connection's location. The payload is forwarded
    /// verbatim to every location subscriber, including our own.
    fn set_location(
        &self,
        location: Value,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}
