//! The local member list of one Space.

use serde_json::Value;
use tether_protocol::{ClientId, LastEvent, MemberKey, SpaceMember};

use crate::{Location, Profile};

/// Whether a member's display profile could be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileState {
    Resolved(Profile),
    Unresolved,
}

impl ProfileState {
    /// The profile, if resolved.
    pub fn profile(&self) -> Option<&Profile> {
        match self {
            Self::Resolved(profile) => Some(profile),
            Self::Unresolved => None,
        }
    }

    /// Returns `true` if a profile was resolved.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }
}

/// One member as the local session sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct Member<L> {
    pub key: MemberKey,
    pub profile: ProfileState,
    /// The profile data the member entered with, as published.
    pub profile_data: Option<Value>,
    pub is_connected: bool,
    /// Last location this member published, if any.
    pub location: Option<L>,
    pub last_event: LastEvent,
}

impl<L: Location> Member<L> {
    /// Builds a member from a transport record. A location that does not
    /// decode into `L` is dropped with a debug log.
    pub fn from_wire(wire: SpaceMember, profile: ProfileState) -> Self {
        let key = wire.key();
        let location = wire.location.and_then(|value| {
            serde_json::from_value(value)
                .map_err(|e| {
                    tracing::debug!(member = %key, error = %e, "stored location not decodable");
                })
                .ok()
        });
        Self {
            key,
            profile,
            profile_data: wire.profile_data,
            is_connected: wire.is_connected,
            location,
            last_event: wire.last_event,
        }
    }
}

impl<L> Member<L> {
    /// The member's user.
    pub fn client_id(&self) -> &ClientId {
        &self.key.client_id
    }
}

/// What [`MemberList::upsert`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced,
}

/// An ordered, duplicate-free list of members.
///
/// Entries are unique by [`MemberKey`]. New members go to the end;
/// replacing a member keeps its position.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberList<L> {
    entries: Vec<Member<L>>,
}

impl<L> MemberList<L> {
    /// An empty list.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn position(&self, key: &MemberKey) -> Option<usize> {
        self.entries.iter().position(|m| &m.key == key)
    }

    /// Replaces the entry with the same key in place, or appends.
    pub fn upsert(&mut self, member: Member<L>) -> Upsert {
        match self.position(&member.key) {
            Some(i) => {
                self.entries[i] = member;
                Upsert::Replaced
            }
            None => {
                self.entries.push(member);
                Upsert::Inserted
            }
        }
    }

    /// Sets the profile of every entry belonging to `client_id`. Returns
    /// how many entries that touched.
    pub fn set_profile(&mut self, client_id: &ClientId, profile: &ProfileState) -> usize {
        let mut touched = 0;
        for member in self.entries.iter_mut().filter(|m| &m.key.client_id == client_id) {
            member.profile = profile.clone();
            touched += 1;
        }
        touched
    }

    /// Removes exactly the entry for `key`.
    pub fn remove(&mut self, key: &MemberKey) -> Option<Member<L>> {
        self.position(key).map(|i| self.entries.remove(i))
    }

    pub fn get(&self, key: &MemberKey) -> Option<&Member<L>> {
        self.position(key).map(|i| &self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Member<L>> {
        self.entries.iter()
    }
}

impl<L: Clone> MemberList<L> {
    /// A copy of the entries, in order.
    pub fn to_vec(&self) -> Vec<Member<L>> {
        self.entries.clone()
    }
}

impl<L> Default for MemberList<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L> FromIterator<Member<L>> for MemberList<L> {
    /// Collects with upsert semantics, so duplicate keys collapse into the
    /// last occurrence at the first occurrence's position.
    fn from_iter<I: IntoIterator<Item = Member<L>>>(iter: I) -> Self {
        let mut list = Self::new();
        for member in iter {
            list.upsert(member);
        }
        list
    }
}
