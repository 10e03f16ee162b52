//! Location publishing and decoding.

use std::fmt::Debug;
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tether_protocol::{LocationUpdate, SpaceMember, Topic};
use tether_transport::{EventSink, RealtimeSpace, Subscription, TransportError};

use crate::SpaceError;

/// A location payload: whatever the application wants to share about
/// where its user is (cursor position, selected cell, open panel, ...).
///
/// Implemented for every type with the right bounds.
pub trait Location:
    Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> Location for T where
    T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// Publishes the local user's location in one Space and decodes the
/// location updates coming back.
///
/// Publishing never touches the member list. Our own update arrives on the
/// location subscription like everyone else's, and is merged from there.
pub struct LocationBroadcaster<S, L> {
    space: S,
    _location: PhantomData<fn() -> L>,
}

impl<S: RealtimeSpace, L: Location> LocationBroadcaster<S, L> {
    /// A broadcaster for `space`.
    pub fn new(space: S) -> Self {
        Self {
            space,
            _location: PhantomData,
        }
    }

    /// Starts the location subscription, delivering into `sink`.
    ///
    /// # Errors
    /// Whatever the transport's subscribe returns.
    pub async fn attach(&self, sink: EventSink) -> Result<Subscription, TransportError> {
        self.space.subscribe(Topic::Locations, sink).await
    }

    /// Serializes `location` and publishes it verbatim.
    ///
    /// # Errors
    /// [`SpaceError::Payload`] if `location` cannot be serialized,
    /// [`SpaceError::Transport`] if the publish fails.
    pub async fn publish(&self, location: &L) -> Result<(), SpaceError> {
        let payload = serde_json::to_value(location)?;
        self.space.set_location(payload).await?;
        Ok(())
    }

    /// Decodes an incoming update. Returns `None`, after logging, when the
    /// payload is not an `L`.
    pub fn decode(&self, update: LocationUpdate) -> Option<(SpaceMember, L)> {
        match serde_json::from_value::<L>(update.payload) {
            Ok(location) => Some((update.member, location)),
            Err(e) => {
                tracing::warn!(
                    space = %self.space.id(),
                    member = %update.member.key(),
                    error = %e,
                    "undecodable location payload ignored"
                );
                None
            }
        }
    }
}

impl<S: Clone, L> Clone for LocationBroadcaster<S, L> {
    fn clone(&self) -> Self {
        Self {
            space: self.space.clone(),
            _location: PhantomData,
        }
    }
}
