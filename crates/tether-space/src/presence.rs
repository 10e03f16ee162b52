//! The presence state machine of one Space.
//!
//! `PresenceTracker` is plain synchronous state. The Space actor owns one
//! and feeds it commands and transport events in arrival order; nothing
//! here awaits, so every transition is atomic with respect to the actor.
//!
//! # Generations
//!
//! Every `enter` starts a new generation and every `leave` starts another.
//! Work spawned on behalf of an entry (the snapshot fetch, the event
//! forwarders) is tagged with the generation it belongs to. A completion
//! whose generation is no longer current is stale and is dropped.
//!
//! # Buffering
//!
//! Subscriptions are opened before the snapshot is fetched, so events can
//! arrive while the list does not exist yet. Those are kept in arrival
//! order and applied on top of the snapshot once it lands.
//!
//! # Profiles
//!
//! Events are applied as soon as they arrive, with whatever profile is
//! already known for their user. Lookups happen outside the tracker; their
//! results come back through [`PresenceTracker::patch_profile`] and are
//! remembered for later entries of the same user.

use std::collections::HashMap;

use tether_protocol::{ClientId, EventName, MemberKey, SpaceId, SubscriptionId};

use crate::{Member, MemberList, Profile, ProfileState, SpaceError, SpaceState, Upsert};

/// What applying one event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Replaced,
    Removed,
    /// A leave for a member we did not have.
    Absent,
    /// Held until the snapshot arrives.
    Buffered,
    /// Unknown event kind, or the Space is not tracking.
    Ignored,
}

impl From<Upsert> for Applied {
    fn from(upsert: Upsert) -> Self {
        match upsert {
            Upsert::Inserted => Self::Inserted,
            Upsert::Replaced => Self::Replaced,
        }
    }
}

#[derive(Debug)]
enum Pending<L> {
    Member(Member<L>),
    Location(Member<L>),
}

/// Member list, self record, and entry lifecycle of one Space.
#[derive(Debug)]
pub struct PresenceTracker<L> {
    space: SpaceId,
    self_key: MemberKey,
    state: SpaceState,
    generation: u64,
    members: Option<MemberList<L>>,
    self_record: Option<Member<L>>,
    pending: Vec<Pending<L>>,
    /// Subscriptions opened by the current entry.
    subscriptions: Vec<SubscriptionId>,
    /// Resolved profiles seen during the current entry.
    profiles: HashMap<ClientId, Profile>,
}

impl<L: Clone> PresenceTracker<L> {
    /// A tracker for `space`, where the local session appears as
    /// `self_key`.
    pub fn new(space: SpaceId, self_key: MemberKey) -> Self {
        Self {
            space,
            self_key,
            state: SpaceState::NotEntered,
            generation: 0,
            members: None,
            self_record: None,
            pending: Vec::new(),
            subscriptions: Vec::new(),
            profiles: HashMap::new(),
        }
    }

    pub fn state(&self) -> SpaceState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn self_key(&self) -> &MemberKey {
        &self.self_key
    }

    /// Adopts a new identity after the connection was re-established.
    /// Only takes effect while `NotEntered`.
    pub fn set_self_key(&mut self, key: MemberKey) -> bool {
        if self.state != SpaceState::NotEntered {
            return false;
        }
        if self.self_key != key {
            tracing::debug!(space = %self.space, from = %self.self_key, to = %key, "self key changed");
            self.self_key = key;
        }
        true
    }

    fn transition(&mut self, target: SpaceState) -> Result<(), SpaceError> {
        if !self.state.can_transition_to(target) {
            return Err(SpaceError::InvalidState(format!(
                "space {} cannot go from {} to {target}",
                self.space, self.state
            )));
        }
        tracing::debug!(space = %self.space, from = %self.state, to = %target, "space state");
        self.state = target;
        Ok(())
    }

    /// Starts a new entry and returns its generation.
    ///
    /// # Errors
    /// [`SpaceError::InvalidState`] unless the Space is `NotEntered`.
    pub fn begin_enter(&mut self) -> Result<u64, SpaceError> {
        self.transition(SpaceState::Entering)?;
        self.generation += 1;
        self.members = None;
        self.self_record = None;
        self.pending.clear();
        self.subscriptions.clear();
        self.profiles.clear();
        Ok(self.generation)
    }

    /// Notes a subscription opened for the current entry, so `leave`
    /// closes exactly it.
    pub fn record_subscription(&mut self, id: SubscriptionId) {
        self.subscriptions.push(id);
    }

    /// Returns `true` if work tagged `generation` still matters.
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && self.state.is_present()
    }

    /// Rolls back an entry that failed before it published anything.
    /// Returns the subscriptions to close.
    pub fn abort_enter(&mut self, generation: u64) -> Vec<SubscriptionId> {
        if generation != self.generation || self.state != SpaceState::Entering {
            return Vec::new();
        }
        self.state = SpaceState::NotEntered;
        self.generation += 1;
        self.pending.clear();
        self.profiles.clear();
        std::mem::take(&mut self.subscriptions)
    }

    /// Installs the entry snapshot, then replays buffered events on top.
    ///
    /// Returns `false`, changing nothing, if `generation` is stale.
    pub fn bootstrap(
        &mut self,
        generation: u64,
        snapshot: Vec<Member<L>>,
        self_member: Option<Member<L>>,
    ) -> bool {
        if !self.is_current(generation) || self.members.is_some() {
            tracing::debug!(space = %self.space, generation, "stale snapshot discarded");
            return false;
        }

        for member in snapshot.iter().chain(self_member.iter()) {
            self.remember(member);
        }
        let list: MemberList<L> = snapshot.into_iter().collect();
        self.self_record =
            self_member.or_else(|| list.get(&self.self_key).cloned());
        self.members = Some(list);

        let buffered = std::mem::take(&mut self.pending);
        let replayed = buffered.len();
        for event in buffered {
            match event {
                Pending::Member(member) => self.apply_member(member),
                Pending::Location(member) => self.apply_location(member),
            };
        }

        if self.state == SpaceState::Entering {
            self.state = SpaceState::Entered;
        }
        tracing::info!(
            space = %self.space,
            members = self.members.as_ref().map_or(0, MemberList::len),
            replayed,
            "space entered"
        );
        true
    }

    /// Applies a membership event, dispatching on its kind: `enter` and
    /// `update` upsert, `leave` removes, anything else is ignored.
    pub fn apply_member(&mut self, member: Member<L>) -> Applied {
        if !self.state.is_present() {
            return Applied::Ignored;
        }
        if let EventName::Other(kind) = &member.last_event.name {
            tracing::debug!(space = %self.space, %kind, member = %member.key, "unknown member event ignored");
            return Applied::Ignored;
        }
        if self.members.is_none() {
            self.pending.push(Pending::Member(member));
            return Applied::Buffered;
        }

        match member.last_event.name {
            EventName::Leave => self.remove(&member.key),
            _ => self.upsert(member),
        }
    }

    /// Applies a location update: the member is upserted into the same
    /// list with its new location.
    pub fn apply_location(&mut self, member: Member<L>) -> Applied {
        if !self.state.is_present() {
            return Applied::Ignored;
        }
        if self.members.is_none() {
            self.pending.push(Pending::Location(member));
            return Applied::Buffered;
        }
        self.upsert(member)
    }

    fn remember(&mut self, member: &Member<L>) {
        if let Some(profile) = member.profile.profile() {
            self.profiles
                .insert(member.client_id().clone(), profile.clone());
        }
    }

    fn upsert(&mut self, mut incoming: Member<L>) -> Applied {
        if self.members.is_none() {
            return Applied::Ignored;
        }
        self.remember(&incoming);
        if !incoming.profile.is_resolved() {
            if let Some(profile) = self.profiles.get(incoming.client_id()) {
                incoming.profile = ProfileState::Resolved(profile.clone());
            }
        }

        let Some(list) = self.members.as_mut() else {
            return Applied::Ignored;
        };

        // A failed resolution does not wipe a profile we already had, and
        // a membership event without a location keeps the last one.
        if let Some(prev) = list.get(&incoming.key) {
            if !incoming.profile.is_resolved() && prev.profile.is_resolved() {
                incoming.profile = prev.profile.clone();
            }
            if incoming.location.is_none() {
                incoming.location = prev.location.clone();
            }
        }

        let is_self = incoming.key == self.self_key;
        let key = incoming.key.clone();
        let outcome = list.upsert(incoming);
        if is_self {
            self.self_record = list.get(&key).cloned();
        }
        outcome.into()
    }

    fn remove(&mut self, key: &MemberKey) -> Applied {
        let Some(list) = self.members.as_mut() else {
            return Applied::Ignored;
        };
        if *key == self.self_key {
            self.self_record = None;
        }
        match list.remove(key) {
            Some(_) => Applied::Removed,
            None => Applied::Absent,
        }
    }

    /// Starts leaving. Drops the list and the self record and returns the
    /// new generation plus the subscriptions this entry opened.
    ///
    /// Returns `None` when there is nothing to leave (`NotEntered`) or a
    /// leave is already running.
    pub fn begin_leave(&mut self) -> Option<(u64, Vec<SubscriptionId>)> {
        if !self.state.is_present() {
            return None;
        }
        self.state = SpaceState::Leaving;
        self.generation += 1;
        self.members = None;
        self.self_record = None;
        self.pending.clear();
        self.profiles.clear();
        tracing::debug!(space = %self.space, generation = self.generation, "space leaving");
        Some((self.generation, std::mem::take(&mut self.subscriptions)))
    }

    /// Completes the leave started at `generation`.
    pub fn finish_leave(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.state != SpaceState::Leaving {
            return false;
        }
        self.state = SpaceState::NotEntered;
        true
    }

    /// The member list; `None` until bootstrapped and after teardown.
    pub fn members(&self) -> Option<&MemberList<L>> {
        self.members.as_ref()
    }

    /// The local session's own record.
    pub fn self_member(&self) -> Option<&Member<L>> {
        self.self_record.as_ref()
    }

    /// A resolved profile already held for `client_id` (any of its
    /// connections).
    pub fn resolved_profile(&self, client_id: &ClientId) -> Option<&Profile> {
        self.profiles.get(client_id)
    }

    /// Installs a profile looked up for `client_id` on every entry of that
    /// user, including our own record, and remembers it for later events.
    ///
    /// Returns how many list entries changed. Ignored unless entering or
    /// entered.
    pub fn patch_profile(&mut self, client_id: &ClientId, profile: Profile) -> usize {
        if !self.state.is_present() {
            return 0;
        }
        let resolved = ProfileState::Resolved(profile.clone());
        self.profiles.insert(client_id.clone(), profile);

        let mut patched = 0;
        if let Some(list) = self.members.as_mut() {
            patched = list.set_profile(client_id, &resolved);
        }
        if let Some(own) = self.self_record.as_mut() {
            if own.client_id() == client_id {
                own.profile = resolved;
            }
        }
        tracing::trace!(space = %self.space, %client_id, patched, "profile patched");
        patched
    }

    /// Subscriptions the current entry holds.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use tether_protocol::LastEvent;

    use super::*;
    use crate::ProfileState;

    type Loc = (i32, i32);

    fn space() -> SpaceId {
        SpaceId::workspace("W1").unwrap()
    }

    fn me() -> MemberKey {
        MemberKey::new("me", "c0")
    }

    fn event(client: &str, conn: &str, name: EventName) -> Member<Loc> {
        Member {
            key: MemberKey::new(client, conn),
            profile: ProfileState::Unresolved,
            profile_data: None,
            is_connected: name != EventName::Leave,
            location: None,
            last_event: LastEvent { name, timestamp: 1 },
        }
    }

    fn located(client: &str, conn: &str, at: Loc) -> Member<Loc> {
        Member {
            location: Some(at),
            ..event(client, conn, EventName::Update)
        }
    }

    fn resolved(mut member: Member<Loc>, name: &str) -> Member<Loc> {
        member.profile = ProfileState::Resolved(Profile::new(
            member.key.client_id.clone(),
            "",
            name,
            "",
        ));
        member
    }

    /// A tracker that has entered with `snapshot`.
    fn entered(snapshot: Vec<Member<Loc>>) -> PresenceTracker<Loc> {
        let mut tracker = PresenceTracker::new(space(), me());
        let generation = tracker.begin_enter().unwrap();
        assert!(tracker.bootstrap(generation, snapshot, None));
        tracker
    }

    fn keys(tracker: &PresenceTracker<Loc>) -> Vec<String> {
        tracker
            .members()
            .map(|l| l.iter().map(|m| m.key.to_string()).collect())
            .unwrap_or_default()
    }

    // =====================================================================
    // Lifecycle
    // =====================================================================

    #[test]
    fn test_new_tracker_has_no_list() {
        let tracker = PresenceTracker::<Loc>::new(space(), me());
        assert_eq!(tracker.state(), SpaceState::NotEntered);
        assert!(tracker.members().is_none());
        assert!(tracker.self_member().is_none());
    }

    #[test]
    fn test_begin_enter_twice_returns_invalid_state() {
        let mut tracker = PresenceTracker::<Loc>::new(space(), me());
        tracker.begin_enter().unwrap();
        assert!(matches!(tracker.begin_enter(), Err(SpaceError::InvalidState(_))));
    }

    #[test]
    fn test_bootstrap_moves_to_entered_and_sets_self_record() {
        let mut tracker = PresenceTracker::new(space(), me());
        let generation = tracker.begin_enter().unwrap();
        assert_eq!(tracker.state(), SpaceState::Entering);

        let own = event("me", "c0", EventName::Enter);
        assert!(tracker.bootstrap(generation, vec![own.clone()], None));

        assert_eq!(tracker.state(), SpaceState::Entered);
        assert_eq!(tracker.self_member().unwrap().key, me());
    }

    #[test]
    fn test_bootstrap_with_stale_generation_is_discarded() {
        let mut tracker = PresenceTracker::<Loc>::new(space(), me());
        let old = tracker.begin_enter().unwrap();
        let (leave_gen, _) = tracker.begin_leave().unwrap();
        tracker.finish_leave(leave_gen);

        assert!(!tracker.bootstrap(old, vec![event("u1", "c1", EventName::Enter)], None));

        assert_eq!(tracker.state(), SpaceState::NotEntered);
        assert!(tracker.members().is_none());
    }

    #[test]
    fn test_leave_drops_list_and_returns_exact_subscriptions() {
        let mut tracker = PresenceTracker::<Loc>::new(space(), me());
        let generation = tracker.begin_enter().unwrap();
        tracker.record_subscription(SubscriptionId(4));
        tracker.record_subscription(SubscriptionId(5));
        tracker.bootstrap(generation, vec![event("me", "c0", EventName::Enter)], None);

        let (leave_gen, subs) = tracker.begin_leave().unwrap();

        assert_eq!(subs, vec![SubscriptionId(4), SubscriptionId(5)]);
        assert_eq!(tracker.state(), SpaceState::Leaving);
        assert!(tracker.members().is_none());
        assert!(tracker.self_member().is_none());
        assert_eq!(tracker.subscription_count(), 0);
        assert!(!tracker.is_current(generation));

        assert!(tracker.finish_leave(leave_gen));
        assert_eq!(tracker.state(), SpaceState::NotEntered);
    }

    #[test]
    fn test_begin_leave_when_not_entered_returns_none() {
        let mut tracker = PresenceTracker::<Loc>::new(space(), me());
        assert!(tracker.begin_leave().is_none());
    }

    #[test]
    fn test_abort_enter_returns_to_not_entered() {
        let mut tracker = PresenceTracker::<Loc>::new(space(), me());
        let generation = tracker.begin_enter().unwrap();
        tracker.record_subscription(SubscriptionId(1));

        let subs = tracker.abort_enter(generation);

        assert_eq!(subs, vec![SubscriptionId(1)]);
        assert_eq!(tracker.state(), SpaceState::NotEntered);
        assert!(!tracker.is_current(generation));
        assert!(tracker.begin_enter().is_ok());
    }

    // =====================================================================
    // Events
    // =====================================================================

    #[test]
    fn test_apply_enter_already_in_snapshot_keeps_one_entry() {
        let mut tracker = entered(vec![event("u1", "c1", EventName::Enter)]);

        let applied = tracker.apply_member(event("u1", "c1", EventName::Enter));

        assert_eq!(applied, Applied::Replaced);
        assert_eq!(keys(&tracker), ["u1/c1"]);
    }

    #[test]
    fn test_apply_leave_removes_only_that_connection() {
        let mut tracker = entered(vec![
            event("u1", "c1", EventName::Enter),
            event("u1", "c2", EventName::Enter),
        ]);

        assert_eq!(
            tracker.apply_member(event("u1", "c1", EventName::Leave)),
            Applied::Removed
        );
        assert_eq!(keys(&tracker), ["u1/c2"]);

        assert_eq!(
            tracker.apply_member(event("u1", "c1", EventName::Leave)),
            Applied::Absent
        );
    }

    #[test]
    fn test_apply_two_updates_last_write_wins() {
        let mut tracker = entered(vec![]);
        tracker.apply_member(event("u1", "c1", EventName::Enter));

        tracker.apply_location(located("u1", "c1", (1, 1)));
        tracker.apply_location(located("u1", "c1", (2, 3)));

        let list = tracker.members().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list.iter().next().unwrap().location, Some((2, 3)));
    }

    #[test]
    fn test_apply_distinct_sessions_keeps_distinct_entries() {
        let mut tracker = entered(vec![]);
        tracker.apply_member(event("u1", "c1", EventName::Enter));
        tracker.apply_member(event("u1", "c2", EventName::Enter));
        assert_eq!(keys(&tracker), ["u1/c1", "u1/c2"]);
    }

    #[test]
    fn test_apply_unknown_kind_leaves_list_unchanged() {
        let mut tracker = entered(vec![event("u1", "c1", EventName::Enter)]);
        let before = tracker.members().cloned();

        let applied =
            tracker.apply_member(event("u2", "c1", EventName::Other("present".into())));

        assert_eq!(applied, Applied::Ignored);
        assert_eq!(tracker.members().cloned(), before);
    }

    #[test]
    fn test_events_before_snapshot_are_replayed_in_order() {
        let mut tracker = PresenceTracker::new(space(), me());
        let generation = tracker.begin_enter().unwrap();

        assert_eq!(
            tracker.apply_member(event("u2", "c1", EventName::Enter)),
            Applied::Buffered
        );
        tracker.apply_location(located("u1", "c1", (9, 9)));
        tracker.apply_member(event("u3", "c1", EventName::Leave));

        tracker.bootstrap(
            generation,
            vec![
                event("u1", "c1", EventName::Enter),
                event("u3", "c1", EventName::Enter),
            ],
            None,
        );

        assert_eq!(keys(&tracker), ["u1/c1", "u2/c1"]);
        let u1 = tracker.members().unwrap().get(&MemberKey::new("u1", "c1")).unwrap();
        assert_eq!(u1.location, Some((9, 9)));
    }

    #[test]
    fn test_unresolved_enter_keeps_previous_profile() {
        let mut tracker = entered(vec![resolved(event("u1", "c1", EventName::Enter), "Ada")]);

        tracker.apply_member(event("u1", "c1", EventName::Enter));

        let member = tracker.members().unwrap().get(&MemberKey::new("u1", "c1")).unwrap();
        assert_eq!(member.profile.profile().unwrap().display_name, "Ada");
        assert_eq!(
            tracker.resolved_profile(&ClientId::new("u1")).unwrap().display_name,
            "Ada"
        );
    }

    #[test]
    fn test_member_event_without_location_keeps_last_location() {
        let mut tracker = entered(vec![]);
        tracker.apply_location(located("u1", "c1", (4, 4)));

        tracker.apply_member(event("u1", "c1", EventName::Update));

        let member = tracker.members().unwrap().get(&MemberKey::new("u1", "c1")).unwrap();
        assert_eq!(member.location, Some((4, 4)));
    }

    #[test]
    fn test_self_record_follows_own_events() {
        let mut tracker = entered(vec![]);
        assert!(tracker.self_member().is_none());

        tracker.apply_member(event("me", "c0", EventName::Enter));
        assert!(tracker.self_member().is_some());

        tracker.apply_location(located("me", "c0", (1, 2)));
        assert_eq!(tracker.self_member().unwrap().location, Some((1, 2)));

        tracker.apply_member(event("me", "c0", EventName::Leave));
        assert!(tracker.self_member().is_none());
    }

    #[test]
    fn test_events_after_leave_are_ignored() {
        let mut tracker = entered(vec![]);
        tracker.begin_leave();

        assert_eq!(
            tracker.apply_member(event("u1", "c1", EventName::Enter)),
            Applied::Ignored
        );
        assert!(tracker.members().is_none());
    }

    #[test]
    fn test_enter_locate_leave_scenario() {
        let mut tracker = entered(vec![]);

        tracker.apply_member(event("u1", "c1", EventName::Enter));
        assert_eq!(keys(&tracker), ["u1/c1"]);

        tracker.apply_location(located("u1", "c1", (5, 2)));
        let list = tracker.members().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list.iter().next().unwrap().location, Some((5, 2)));

        tracker.apply_member(event("u1", "c1", EventName::Leave));
        assert!(keys(&tracker).is_empty());
    }

    // =====================================================================
    // Profiles
    // =====================================================================

    fn ada() -> Profile {
        Profile::new(ClientId::new("u1"), "", "Ada", "Lovelace")
    }

    #[test]
    fn test_patch_profile_updates_every_session_of_the_user() {
        let mut tracker = entered(vec![]);
        tracker.apply_member(event("u1", "c1", EventName::Enter));
        tracker.apply_member(event("u1", "c2", EventName::Enter));
        tracker.apply_member(event("u2", "c1", EventName::Enter));

        assert_eq!(tracker.patch_profile(&ClientId::new("u1"), ada()), 2);

        let list = tracker.members().unwrap();
        assert!(list.get(&MemberKey::new("u1", "c2")).unwrap().profile.is_resolved());
        assert!(!list.get(&MemberKey::new("u2", "c1")).unwrap().profile.is_resolved());
    }

    #[test]
    fn test_patch_profile_is_reused_by_later_events() {
        let mut tracker = entered(vec![]);
        tracker.patch_profile(&ClientId::new("u1"), ada());

        tracker.apply_member(event("u1", "c3", EventName::Enter));

        let member = tracker.members().unwrap().get(&MemberKey::new("u1", "c3")).unwrap();
        assert_eq!(member.profile, ProfileState::Resolved(ada()));
    }

    #[test]
    fn test_patch_profile_while_entering_applies_on_replay() {
        let mut tracker = PresenceTracker::new(space(), me());
        let generation = tracker.begin_enter().unwrap();
        tracker.apply_member(event("u1", "c1", EventName::Enter));

        assert_eq!(tracker.patch_profile(&ClientId::new("u1"), ada()), 0);
        tracker.bootstrap(generation, vec![], None);

        let member = tracker.members().unwrap().get(&MemberKey::new("u1", "c1")).unwrap();
        assert!(member.profile.is_resolved());
    }

    #[test]
    fn test_patch_profile_reaches_self_record() {
        let mut tracker = entered(vec![]);
        tracker.apply_member(event("me", "c0", EventName::Enter));
        let mine = Profile::new(ClientId::new("me"), "", "Me", "");

        tracker.patch_profile(&ClientId::new("me"), mine.clone());

        assert_eq!(tracker.self_member().unwrap().profile, ProfileState::Resolved(mine));
    }

    #[test]
    fn test_patch_profile_after_leave_is_ignored() {
        let mut tracker = entered(vec![]);
        tracker.begin_leave();

        assert_eq!(tracker.patch_profile(&ClientId::new("u1"), ada()), 0);
        assert!(tracker.resolved_profile(&ClientId::new("u1")).is_none());
    }

    #[test]
    fn test_leave_forgets_known_profiles() {
        let mut tracker = entered(vec![resolved(event("u1", "c1", EventName::Enter), "Ada")]);
        assert!(tracker.resolved_profile(&ClientId::new("u1")).is_some());

        let (generation, _) = tracker.begin_leave().unwrap();
        tracker.finish_leave(generation);

        assert!(tracker.resolved_profile(&ClientId::new("u1")).is_none());
    }

    #[test]
    fn test_set_self_key_only_while_not_entered() {
        let mut tracker = entered(vec![]);
        let next = MemberKey::new("me", "c9");
        assert!(!tracker.set_self_key(next.clone()));
        assert_eq!(tracker.self_key(), &me());

        let (generation, _) = tracker.begin_leave().unwrap();
        tracker.finish_leave(generation);

        assert!(tracker.set_self_key(next.clone()));
        assert_eq!(tracker.self_key(), &next);
    }
}
