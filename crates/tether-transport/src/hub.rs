//! The authoritative pub/sub state behind every Tether transport.
//!
//! A `Hub` knows, per Space, who is entered and who is subscribed to what.
//! Every mutation publishes the resulting event to the matching
//! subscribers before the call returns, so each sink receives events in
//! the order the hub applied them, including across topics when several
//! subscriptions share one sink.
//!
//! The state sits behind a `std::sync::Mutex`: every operation is a short
//! in-memory update plus an unbounded channel send, never an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tether_protocol::{
    ClientId, ConnectionId, EventName, LastEvent, LocationUpdate, MemberKey,
    SpaceEvent, SpaceId, SpaceMember, SubscriptionId, Topic,
};
use crate::{Delivery, EventSink, Subscription, TransportError};

struct Subscriber {
    id: SubscriptionId,
    topic: Topic,
    owner: ConnectionId,
    sink: EventSink,
}

#[derive(Default)]
struct HubSpace {
    /// Entered members, in entry order.
    members: Vec<SpaceMember>,
    subscribers: Vec<Subscriber>,
}

impl HubSpace {
    fn is_idle(&self) -> bool {
        self.members.is_empty() && self.subscribers.is_empty()
    }

    fn position(&self, key: &MemberKey) -> Option<usize> {
        self.members.iter().position(|m| m.is(key))
    }

    /// Sends `event` to every subscriber of its topic. Subscribers whose
    /// receiver is gone are pruned.
    fn publish(&mut self, event: &SpaceEvent) {
        self.subscribers.retain(|sub| {
            if !sub.topic.carries(event) {
                return true;
            }
            let delivery = Delivery {
                subscription: sub.id,
                event: event.clone(),
            };
            sub.sink.send(delivery).is_ok()
        });
    }
}

#[derive(Default)]
struct HubState {
    spaces: HashMap<SpaceId, HubSpace>,
    next_subscription: u64,
    next_connection: u64,
}

impl HubState {
    /// Drops a Space's entry once nobody is in it or listening to it.
    fn collect(&mut self, space: &SpaceId) {
        if self.spaces.get(space).is_some_and(HubSpace::is_idle) {
            self.spaces.remove(space);
            tracing::debug!(%space, "space released");
        }
    }
}

/// Shared in-memory pub/sub state. Cheap to clone.
#[derive(Clone, Default)]
pub struct Hub {
    state: Arc<Mutex<HubState>>,
}

impl Hub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        // A panic while holding the lock leaves plain data behind; keep
        // serving rather than poisoning every later caller.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a new connection for `client_id` and returns the key it
    /// appears as in every Space.
    pub fn open_connection(&self, client_id: ClientId) -> MemberKey {
        let mut state = self.lock();
        state.next_connection += 1;
        let key = MemberKey {
            client_id,
            connection_id: ConnectionId::new(format!(
                "conn-{}",
                state.next_connection
            )),
        };
        tracing::debug!(member = %key, "connection opened");
        key
    }

    /// Enters `key` into `space`, or refreshes its record if already
    /// entered. Publishes an `enter` member event.
    pub fn enter(
        &self,
        space: &SpaceId,
        key: &MemberKey,
        profile_data: Option<Value>,
    ) -> SpaceMember {
        let mut state = self.lock();
        let hub_space = state.spaces.entry(space.clone()).or_default();

        let member = SpaceMember {
            client_id: key.client_id.clone(),
            connection_id: key.connection_id.clone(),
            profile_data,
            is_connected: true,
            location: hub_space
                .position(key)
                .and_then(|i| hub_space.members[i].location.clone()),
            last_event: LastEvent::now(EventName::Enter),
        };

        match hub_space.position(key) {
            Some(i) => hub_space.members[i] = member.clone(),
            None => hub_space.members.push(member.clone()),
        }
        hub_space.publish(&SpaceEvent::Member(member.clone()));

        tracing::info!(%space, member = %key, "member entered");
        member
    }

    /// Removes `key` from `space` and publishes a `leave` member event.
    ///
    /// Returns the final record, or `None` if `key` was not entered.
    pub fn leave(&self, space: &SpaceId, key: &MemberKey) -> Option<SpaceMember> {
        let mut state = self.lock();
        let hub_space = state.spaces.get_mut(space)?;
        let i = hub_space.position(key)?;

        let mut member = hub_space.members.remove(i);
        member.is_connected = false;
        member.last_event = LastEvent::now(EventName::Leave);
        hub_space.publish(&SpaceEvent::Member(member.clone()));

        tracing::info!(%space, member = %key, "member left");
        state.collect(space);
        Some(member)
    }

    /// Replaces the profile data of an entered member and publishes an
    /// `update` member event.
    ///
    /// # Errors
    /// [`TransportError::NotEntered`] if `key` is not in `space`.
    pub fn update_profile(
        &self,
        space: &SpaceId,
        key: &MemberKey,
        profile_data: Option<Value>,
    ) -> Result<SpaceMember, TransportError> {
        let mut state = self.lock();
        let hub_space = state
            .spaces
            .get_mut(space)
            .ok_or_else(|| TransportError::NotEntered(space.clone()))?;
        let i = hub_space
            .position(key)
            .ok_or_else(|| TransportError::NotEntered(space.clone()))?;

        let member = &mut hub_space.members[i];
        member.profile_data = profile_data;
        member.last_event = LastEvent::now(EventName::Update);
        let member = member.clone();
        hub_space.publish(&SpaceEvent::Member(member.clone()));

        tracing::debug!(%space, member = %key, "member updated");
        Ok(member)
    }

    /// Every member of `space`, in entry order.
    pub fn members(&self, space: &SpaceId) -> Vec<SpaceMember> {
        self.lock()
            .spaces
            .get(space)
            .map(|s| s.members.clone())
            .unwrap_or_default()
    }

    /// One member's record, if entered.
    pub fn member(&self, space: &SpaceId, key: &MemberKey) -> Option<SpaceMember> {
        let state = self.lock();
        let hub_space = state.spaces.get(space)?;
        hub_space.position(key).map(|i| hub_space.members[i].clone())
    }

    /// Starts delivering `topic` events of `space` into `sink`, on
    /// behalf of connection `owner`.
    pub fn subscribe(
        &self,
        space: &SpaceId,
        topic: Topic,
        owner: &ConnectionId,
        sink: EventSink,
    ) -> Subscription {
        let mut state = self.lock();
        state.next_subscription += 1;
        let id = SubscriptionId(state.next_subscription);

        state
            .spaces
            .entry(space.clone())
            .or_default()
            .subscribers
            .push(Subscriber {
                id,
                topic,
                owner: owner.clone(),
                sink,
            });

        tracing::debug!(%space, subscription = %id, %topic, "subscribed");
        Subscription { id, topic }
    }

    /// Stops one subscription. Returns `false` if it was unknown.
    pub fn unsubscribe(&self, space: &SpaceId, id: SubscriptionId) -> bool {
        let mut state = self.lock();
        let Some(hub_space) = state.spaces.get_mut(space) else {
            return false;
        };
        let before = hub_space.subscribers.len();
        hub_space.subscribers.retain(|s| s.id != id);
        let removed = hub_space.subscribers.len() != before;

        if removed {
            tracing::debug!(%space, subscription = %id, "unsubscribed");
        }
        state.collect(space);
        removed
    }

    /// Stores `key`'s location and forwards `location` to every location
    /// subscriber of `space`.
    ///
    /// # Errors
    /// [`TransportError::NotEntered`] if `key` is not in `space`.
    pub fn set_location(
        &self,
        space: &SpaceId,
        key: &MemberKey,
        location: Value,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        let hub_space = state
            .spaces
            .get_mut(space)
            .ok_or_else(|| TransportError::NotEntered(space.clone()))?;
        let i = hub_space
            .position(key)
            .ok_or_else(|| TransportError::NotEntered(space.clone()))?;

        hub_space.members[i].location = Some(location.clone());
        let update = LocationUpdate {
            member: hub_space.members[i].clone(),
            payload: location,
        };
        hub_space.publish(&SpaceEvent::Location(update));
        Ok(())
    }

    /// Forgets a connection: drops its subscriptions and leaves every
    /// Space it was in, publishing `leave` events to the others.
    pub fn disconnect(&self, connection: &ConnectionId) {
        let mut state = self.lock();
        let mut touched = Vec::new();

        for (space, hub_space) in state.spaces.iter_mut() {
            hub_space.subscribers.retain(|s| &s.owner != connection);

            while let Some(i) = hub_space
                .members
                .iter()
                .position(|m| &m.connection_id == connection)
            {
                let mut member = hub_space.members.remove(i);
                member.is_connected = false;
                member.last_event = LastEvent::now(EventName::Leave);
                hub_space.publish(&SpaceEvent::Member(member));
            }
            touched.push(space.clone());
        }

        for space in &touched {
            state.collect(space);
        }
        tracing::debug!(%connection, "connection closed");
    }

    /// Number of live subscriptions on `space`.
    pub fn subscription_count(&self, space: &SpaceId) -> usize {
        self.lock()
            .spaces
            .get(space)
            .map_or(0, |s| s.subscribers.len())
    }

    /// Number of entered members in `space`.
    pub fn member_count(&self, space: &SpaceId) -> usize {
        self.lock()
            .spaces
            .get(space)
            .map_or(0, |s| s.members.len())
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("spaces", &self.lock().spaces.len())
            .finish()
    }
}
