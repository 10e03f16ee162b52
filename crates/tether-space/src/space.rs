//! Space actor: an isolated Tokio task that owns one Space's presence.
//!
//! All mutation of a Space's member list happens on its actor, one
//! command at a time. Both transport subscriptions of an entry deliver
//! into one sink, drained by a single forwarder, so member and location
//! events reach the actor in the order the transport published them.
//! Work that must not hold the actor up (the entry snapshot, profile
//! lookups, leave teardown) runs in spawned tasks that report back
//! through the same channel, tagged with the generation they belong to.
//!
//! ```text
//! Space (handle) ──┐
//! forwarder ───────┤
//! snapshot task ───┼──▶ mpsc ──▶ SpaceActor ──▶ PresenceTracker
//! lookup tasks ────┤                  │
//! teardown task ───┘                  └──▶ RealtimeSpace (subscribe/enter/…)
//!
//! Connection state (watch) ──▶ SpaceActor   (link lost → rejoin)
//! ```
//!
//! When the connection drops, the transport has already removed us from
//! the Space. The actor drops its list, and once the connection is back
//! it enters again with the profile data it last entered with.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tether_protocol::{
    ClientId, EventName, MemberKey, SpaceEvent, SpaceId, SubscriptionId, Topic,
};
use tether_transport::{ConnectionState, Delivery, RealtimeSpace, TransportError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;

use crate::{
    Location, LocationBroadcaster, Member, MemberDirectory, MemberList,
    PresenceTracker, Profile, ProfileState, SpaceConfig, SpaceError, SpaceState,
};

type Reply<T> = oneshot::Sender<Result<T, SpaceError>>;

/// Commands sent to a Space actor through its channel.
pub(crate) enum SpaceCommand<L> {
    Enter {
        profile_data: Option<Value>,
        reply: Reply<()>,
    },
    Leave {
        reply: Reply<()>,
    },
    UpdateProfile {
        profile_data: Option<Value>,
        reply: Reply<()>,
    },
    SetLocation {
        location: L,
        reply: Reply<()>,
    },
    Members {
        reply: oneshot::Sender<Option<Vec<Member<L>>>>,
    },
    SelfMember {
        reply: oneshot::Sender<Option<Member<L>>>,
    },
    Info {
        reply: oneshot::Sender<SpaceInfo>,
    },

    /// A transport event, from the forwarder of `generation`.
    Event {
        generation: u64,
        event: SpaceEvent,
    },
    /// The event stream of `generation` ended: the transport dropped our
    /// subscriptions.
    StreamEnded {
        generation: u64,
    },
    /// A directory lookup started at `generation` finished. `None` when
    /// it failed or timed out.
    ProfileResolved {
        generation: u64,
        client_id: ClientId,
        profile: Option<Profile>,
    },
    /// The snapshot fetch of `generation` finished.
    Bootstrapped {
        generation: u64,
        result: Result<Snapshot<L>, TransportError>,
    },
    /// The teardown of the leave at `generation` finished.
    LeaveCompleted {
        generation: u64,
        result: Result<(), TransportError>,
    },

    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) struct Snapshot<L> {
    members: Vec<Member<L>>,
    self_member: Option<Member<L>>,
}

/// A snapshot of Space metadata (not the member list itself).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceInfo {
    pub id: SpaceId,
    pub state: SpaceState,
    /// Bumped by every enter and every leave.
    pub generation: u64,
    /// `None` while there is no member list.
    pub member_count: Option<usize>,
    /// Transport subscriptions held by the current entry.
    pub subscriptions: usize,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle to a running Space actor.
///
/// Cheap to clone; every clone talks to the same actor. The actor stops
/// when the last handle is dropped or on [`shutdown`](Self::shutdown).
pub struct Space<L> {
    id: SpaceId,
    sender: mpsc::Sender<SpaceCommand<L>>,
}

impl<L> Clone for Space<L> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            sender: self.sender.clone(),
        }
    }
}

impl<L> std::fmt::Debug for Space<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Space").field("id", &self.id).finish_non_exhaustive()
    }
}

impl<L: Location> Space<L> {
    /// The Space's name.
    pub fn id(&self) -> &SpaceId {
        &self.id
    }

    /// Returns `true` once the actor has stopped.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn unavailable(&self) -> SpaceError {
        SpaceError::Unavailable(self.id.clone())
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SpaceCommand<L>,
    ) -> Result<T, SpaceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(command(reply_tx))
            .await
            .map_err(|_| self.unavailable())?;
        reply_rx.await.map_err(|_| self.unavailable())
    }

    /// Enters the Space and resolves once the member list is bootstrapped.
    ///
    /// A no-op when already entered; joins the pending entry when one is
    /// in flight.
    ///
    /// # Errors
    /// - [`SpaceError::Leaving`] while a leave is still tearing down
    /// - [`SpaceError::EnterAborted`] if `leave` is called before the entry
    ///   completes
    /// - [`SpaceError::Transport`] / [`SpaceError::Snapshot`] if the
    ///   transport fails while entering
    pub async fn enter(&self, profile_data: Option<Value>) -> Result<(), SpaceError> {
        self.request(|reply| SpaceCommand::Enter {
            profile_data,
            reply,
        })
        .await?
    }

    /// Leaves the Space and resolves once the transport teardown is done.
    /// A no-op when not entered.
    pub async fn leave(&self) -> Result<(), SpaceError> {
        self.request(|reply| SpaceCommand::Leave { reply }).await?
    }

    /// Re-publishes our profile data; everyone sees an `update` event.
    ///
    /// # Errors
    /// [`SpaceError::NotEntered`] unless entering or entered.
    pub async fn update_profile(
        &self,
        profile_data: Option<Value>,
    ) -> Result<(), SpaceError> {
        self.request(|reply| SpaceCommand::UpdateProfile {
            profile_data,
            reply,
        })
        .await?
    }

    /// Publishes our location. The member list is not touched until the
    /// update comes back through the subscription.
    ///
    /// # Errors
    /// [`SpaceError::NotEntered`] unless entering or entered.
    pub async fn set_location(&self, location: L) -> Result<(), SpaceError> {
        self.request(|reply| SpaceCommand::SetLocation { location, reply })
            .await?
    }

    /// The current member list; `None` before bootstrap and after leave.
    pub async fn members(&self) -> Result<Option<Vec<Member<L>>>, SpaceError> {
        self.request(|reply| SpaceCommand::Members { reply }).await
    }

    /// Our own member record, if we are in the list.
    pub async fn self_member(&self) -> Result<Option<Member<L>>, SpaceError> {
        self.request(|reply| SpaceCommand::SelfMember { reply }).await
    }

    /// Metadata about the Space.
    pub async fn info(&self) -> Result<SpaceInfo, SpaceError> {
        self.request(|reply| SpaceCommand::Info { reply }).await
    }

    /// Leaves (if entered) and stops the actor.
    pub async fn shutdown(&self) -> Result<(), SpaceError> {
        self.request(|reply| SpaceCommand::Shutdown { reply }).await
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct SpaceActor<S, D, L> {
    id: SpaceId,
    space: S,
    broadcaster: LocationBroadcaster<S, L>,
    directory: Arc<D>,
    config: SpaceConfig,
    tracker: PresenceTracker<L>,
    enter_waiters: Vec<Reply<()>>,
    leave_waiters: Vec<Reply<()>>,
    /// Users with a directory lookup in flight.
    lookups: HashSet<ClientId>,
    /// Profile data of the current entry, kept for a rejoin.
    entered_with: Option<Value>,
    /// Set when the link dropped under us; holds the profile data to
    /// re-enter with.
    rejoin: Option<Option<Value>>,
    connection: watch::Receiver<ConnectionState>,
    receiver: mpsc::Receiver<SpaceCommand<L>>,
    /// Handed to spawned tasks. Weak, so they never keep the actor alive.
    sender: mpsc::WeakSender<SpaceCommand<L>>,
}

impl<S, D, L> SpaceActor<S, D, L>
where
    S: RealtimeSpace,
    D: MemberDirectory,
    L: Location,
{
    /// Runs the actor loop until shutdown or until every handle is gone.
    async fn run(mut self) {
        tracing::info!(space = %self.id, "space actor started");
        let mut shutdown_reply = None;
        let mut watching = true;

        loop {
            let cmd = tokio::select! {
                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
                changed = self.connection.changed(), if watching => {
                    match changed {
                        Ok(()) => self.handle_connection_change().await,
                        Err(_) => watching = false,
                    }
                    continue;
                }
            };

            match cmd {
                SpaceCommand::Enter {
                    profile_data,
                    reply,
                } => self.handle_enter(profile_data, reply).await,
                SpaceCommand::Leave { reply } => self.handle_leave(reply),
                SpaceCommand::UpdateProfile {
                    profile_data,
                    reply,
                } => {
                    let result = self.handle_update_profile(profile_data).await;
                    let _ = reply.send(result);
                }
                SpaceCommand::SetLocation { location, reply } => {
                    let result = self.handle_set_location(&location).await;
                    let _ = reply.send(result);
                }
                SpaceCommand::Members { reply } => {
                    let _ = reply.send(self.tracker.members().map(MemberList::to_vec));
                }
                SpaceCommand::SelfMember { reply } => {
                    let _ = reply.send(self.tracker.self_member().cloned());
                }
                SpaceCommand::Info { reply } => {
                    let _ = reply.send(self.info());
                }
                SpaceCommand::Event { generation, event } => {
                    self.handle_event(generation, event);
                }
                SpaceCommand::StreamEnded { generation } => {
                    self.handle_stream_ended(generation).await;
                }
                SpaceCommand::ProfileResolved {
                    generation,
                    client_id,
                    profile,
                } => self.handle_profile_resolved(generation, client_id, profile),
                SpaceCommand::Bootstrapped { generation, result } => {
                    self.handle_bootstrapped(generation, result);
                }
                SpaceCommand::LeaveCompleted { generation, result } => {
                    self.handle_leave_completed(generation, result);
                }
                SpaceCommand::Shutdown { reply } => {
                    tracing::info!(space = %self.id, "space shutting down");
                    shutdown_reply = Some(reply);
                    break;
                }
            }
        }

        self.teardown_inline().await;
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
        tracing::info!(space = %self.id, "space actor stopped");
    }

    // -- enter ------------------------------------------------------------

    async fn handle_enter(&mut self, profile_data: Option<Value>, reply: Reply<()>) {
        match self.tracker.state() {
            SpaceState::Entered => {
                let _ = reply.send(Ok(()));
            }
            SpaceState::Entering => self.enter_waiters.push(reply),
            SpaceState::Leaving => {
                let _ = reply.send(Err(SpaceError::Leaving(self.id.clone())));
            }
            SpaceState::NotEntered => match self.start_enter(profile_data).await {
                Ok(()) => {
                    self.rejoin = None;
                    self.enter_waiters.push(reply);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
        }
    }

    /// Subscribes, enters on the transport, and spawns the snapshot
    /// fetch. On failure everything opened so far is closed again.
    async fn start_enter(&mut self, profile_data: Option<Value>) -> Result<(), SpaceError> {
        let current = match &*self.connection.borrow() {
            ConnectionState::Connected { key } => Some(key.clone()),
            _ => None,
        };
        if let Some(key) = current {
            self.tracker.set_self_key(key);
        }
        let generation = self.tracker.begin_enter()?;
        self.lookups.clear();
        self.entered_with = profile_data.clone();

        if let Err(e) = self.open_entry(generation, profile_data).await {
            tracing::warn!(space = %self.id, error = %e, "enter failed, rolling back");
            for id in self.tracker.abort_enter(generation) {
                self.unsubscribe_quietly(id).await;
            }
            return Err(e.into());
        }

        self.spawn_bootstrap(generation);
        Ok(())
    }

    async fn open_entry(
        &mut self,
        generation: u64,
        profile_data: Option<Value>,
    ) -> Result<(), TransportError> {
        // Membership first, so no enter/leave between the snapshot and
        // the subscription can be missed. Both topics share one sink.
        let (sink, deliveries) = mpsc::unbounded_channel();
        let members = self.space.subscribe(Topic::Members, sink.clone()).await?;
        self.tracker.record_subscription(members.id);

        let locations = self.broadcaster.attach(sink).await?;
        self.tracker.record_subscription(locations.id);
        self.spawn_forwarder(generation, deliveries);

        self.space.enter(profile_data).await
    }

    fn spawn_forwarder(&self, generation: u64, mut deliveries: mpsc::UnboundedReceiver<Delivery>) {
        let sender = self.sender.clone();
        let space = self.id.clone();

        tokio::spawn(async move {
            while let Some(Delivery { event, .. }) = deliveries.recv().await {
                let Some(tx) = sender.upgrade() else { return };
                if tx.send(SpaceCommand::Event { generation, event }).await.is_err() {
                    return;
                }
            }
            tracing::debug!(%space, generation, "event stream ended");
            if let Some(tx) = sender.upgrade() {
                let _ = tx.send(SpaceCommand::StreamEnded { generation }).await;
            }
        });
    }

    fn spawn_bootstrap(&self, generation: u64) {
        let space = self.space.clone();
        let directory = Arc::clone(&self.directory);
        let resolve_profiles = self.config.resolve_snapshot_profiles;
        let timeout = self.config.profile_timeout;
        let sender = self.sender.clone();

        tokio::spawn(async move {
            let result =
                fetch_snapshot::<S, D, L>(&space, directory, resolve_profiles, timeout).await;
            if let Some(tx) = sender.upgrade() {
                let _ = tx.send(SpaceCommand::Bootstrapped { generation, result }).await;
            }
        });
    }

    fn handle_bootstrapped(
        &mut self,
        generation: u64,
        result: Result<Snapshot<L>, TransportError>,
    ) {
        match result {
            Ok(snapshot) => {
                if self
                    .tracker
                    .bootstrap(generation, snapshot.members, snapshot.self_member)
                {
                    for waiter in self.enter_waiters.drain(..) {
                        let _ = waiter.send(Ok(()));
                    }
                }
            }
            Err(e) if self.tracker.is_current(generation) => {
                tracing::warn!(space = %self.id, error = %e, "member snapshot failed, leaving");
                let reason = e.to_string();
                self.start_leave(|space| SpaceError::Snapshot {
                    space,
                    reason: reason.clone(),
                });
            }
            Err(e) => {
                tracing::debug!(space = %self.id, generation, error = %e, "stale snapshot failure ignored");
            }
        }
    }

    // -- leave ------------------------------------------------------------

    fn handle_leave(&mut self, reply: Reply<()>) {
        self.rejoin = None;
        match self.tracker.state() {
            SpaceState::NotEntered => {
                let _ = reply.send(Ok(()));
            }
            SpaceState::Leaving => self.leave_waiters.push(reply),
            SpaceState::Entering | SpaceState::Entered => {
                self.start_leave(SpaceError::EnterAborted);
                self.leave_waiters.push(reply);
            }
        }
    }

    /// Drops local state at once and tears the transport side down in a
    /// spawned task. Pending `enter` callers get `abort(space)`.
    fn start_leave(&mut self, abort: impl Fn(SpaceId) -> SpaceError) {
        let Some((generation, subscriptions)) = self.tracker.begin_leave() else {
            return;
        };
        self.lookups.clear();
        for waiter in self.enter_waiters.drain(..) {
            let _ = waiter.send(Err(abort(self.id.clone())));
        }

        let space = self.space.clone();
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let result = teardown(&space, subscriptions).await;
            if let Some(tx) = sender.upgrade() {
                let _ = tx.send(SpaceCommand::LeaveCompleted { generation, result }).await;
            }
        });
    }

    fn handle_leave_completed(
        &mut self,
        generation: u64,
        result: Result<(), TransportError>,
    ) {
        if !self.tracker.finish_leave(generation) {
            tracing::debug!(space = %self.id, generation, "stale leave completion ignored");
            return;
        }
        match result {
            Ok(()) => tracing::info!(space = %self.id, "space left"),
            // Locally we are out either way; the transport drops what is
            // left of us when the connection closes.
            Err(e) => tracing::warn!(space = %self.id, error = %e, "space left, transport teardown failed"),
        }
        for waiter in self.leave_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Final teardown when the actor stops.
    async fn teardown_inline(&mut self) {
        if let Some((generation, subscriptions)) = self.tracker.begin_leave() {
            for waiter in self.enter_waiters.drain(..) {
                let _ = waiter.send(Err(SpaceError::EnterAborted(self.id.clone())));
            }
            if let Err(e) = teardown(&self.space, subscriptions).await {
                tracing::warn!(space = %self.id, error = %e, "transport teardown failed");
            }
            self.tracker.finish_leave(generation);
        }
        for waiter in self.leave_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Best-effort unsubscribe in the background. Usually the transport
    /// has dropped these already.
    fn release_quietly(&self, subscriptions: Vec<SubscriptionId>) {
        if subscriptions.is_empty() {
            return;
        }
        let space = self.space.clone();
        tokio::spawn(async move {
            for id in subscriptions {
                if let Err(e) = space.unsubscribe(id).await {
                    tracing::trace!(space = %space.id(), subscription = %id, error = %e, "stale subscription not released");
                }
            }
        });
    }

    async fn unsubscribe_quietly(&self, id: SubscriptionId) {
        if let Err(e) = self.space.unsubscribe(id).await {
            tracing::debug!(space = %self.id, subscription = %id, error = %e, "unsubscribe failed");
        }
    }

    // -- requests ---------------------------------------------------------

    async fn handle_update_profile(
        &mut self,
        profile_data: Option<Value>,
    ) -> Result<(), SpaceError> {
        if !self.tracker.state().is_present() {
            return Err(SpaceError::NotEntered(self.id.clone()));
        }
        self.space.update_profile(profile_data.clone()).await?;
        self.entered_with = profile_data;
        Ok(())
    }

    async fn handle_set_location(&self, location: &L) -> Result<(), SpaceError> {
        if !self.tracker.state().is_present() {
            return Err(SpaceError::NotEntered(self.id.clone()));
        }
        self.broadcaster.publish(location).await
    }

    // -- events -----------------------------------------------------------

    /// Applies one transport event right away. A profile the tracker does
    /// not know yet is looked up in the background and patched in later.
    fn handle_event(&mut self, generation: u64, event: SpaceEvent) {
        if !self.tracker.is_current(generation) {
            tracing::debug!(space = %self.id, generation, "stale event discarded");
            return;
        }

        let (client_id, refresh, applied) = match event {
            SpaceEvent::Member(wire) => {
                let client_id = wire.client_id.clone();
                let refresh = match wire.last_event.name {
                    EventName::Enter => Some(true),
                    EventName::Update => Some(false),
                    EventName::Leave | EventName::Other(_) => None,
                };
                let applied = self
                    .tracker
                    .apply_member(Member::from_wire(wire, ProfileState::Unresolved));
                (client_id, refresh, applied)
            }
            SpaceEvent::Location(update) => {
                let Some((wire, location)) = self.broadcaster.decode(update) else {
                    return;
                };
                let client_id = wire.client_id.clone();
                let mut member = Member::from_wire(wire, ProfileState::Unresolved);
                member.location = Some(location);
                (client_id, Some(false), self.tracker.apply_location(member))
            }
        };
        tracing::trace!(space = %self.id, ?applied, "event applied");

        if let Some(refresh) = refresh {
            self.lookup_profile(generation, client_id, refresh);
        }
    }

    /// Starts a directory lookup for `client_id` unless one is running.
    /// Without `refresh`, a user whose profile is already known is skipped.
    fn lookup_profile(&mut self, generation: u64, client_id: ClientId, refresh: bool) {
        if self.lookups.contains(&client_id) {
            return;
        }
        if !refresh && self.tracker.resolved_profile(&client_id).is_some() {
            return;
        }
        self.lookups.insert(client_id.clone());

        let directory = Arc::clone(&self.directory);
        let space = self.id.clone();
        let timeout = self.config.profile_timeout;
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let profile = resolve_profile(directory.as_ref(), &space, &client_id, timeout)
                .await
                .profile()
                .cloned();
            if let Some(tx) = sender.upgrade() {
                let _ = tx
                    .send(SpaceCommand::ProfileResolved {
                        generation,
                        client_id,
                        profile,
                    })
                    .await;
            }
        });
    }

    fn handle_profile_resolved(
        &mut self,
        generation: u64,
        client_id: ClientId,
        profile: Option<Profile>,
    ) {
        if !self.tracker.is_current(generation) {
            tracing::debug!(space = %self.id, generation, %client_id, "stale profile discarded");
            return;
        }
        self.lookups.remove(&client_id);
        if let Some(profile) = profile {
            self.tracker.patch_profile(&client_id, profile);
        }
    }

    // -- connection -------------------------------------------------------

    async fn handle_connection_change(&mut self) {
        let state = self.connection.borrow_and_update().clone();
        match state {
            ConnectionState::Connected { key } => {
                if &key != self.tracker.self_key() {
                    self.handle_link_lost();
                }
                self.try_rejoin().await;
            }
            ConnectionState::Connecting | ConnectionState::Disconnected => {
                self.handle_link_lost();
            }
        }
    }

    async fn handle_stream_ended(&mut self, generation: u64) {
        if !self.tracker.is_current(generation) {
            return;
        }
        self.handle_link_lost();
        self.try_rejoin().await;
    }

    /// The transport already dropped our membership and subscriptions, so
    /// there is nothing to tear down remotely. Drops local state and marks
    /// the entry for a rejoin.
    fn handle_link_lost(&mut self) {
        if !self.tracker.state().is_present() {
            return;
        }
        if let Some((generation, subscriptions)) = self.tracker.begin_leave() {
            self.tracker.finish_leave(generation);
            self.release_quietly(subscriptions);
        }
        self.lookups.clear();
        for waiter in self.enter_waiters.drain(..) {
            let _ = waiter.send(Err(SpaceError::EnterAborted(self.id.clone())));
        }
        self.rejoin = Some(self.entered_with.clone());
        tracing::warn!(space = %self.id, "realtime link lost, space will rejoin");
    }

    /// Re-enters after a lost link, once the connection is up again. A
    /// failed attempt stays pending until the next connection change.
    async fn try_rejoin(&mut self) {
        if self.tracker.state() != SpaceState::NotEntered {
            return;
        }
        if !matches!(&*self.connection.borrow(), ConnectionState::Connected { .. }) {
            return;
        }
        let Some(profile_data) = self.rejoin.take() else {
            return;
        };

        match self.start_enter(profile_data.clone()).await {
            Ok(()) => tracing::info!(space = %self.id, "space rejoining"),
            Err(e) => {
                tracing::warn!(space = %self.id, error = %e, "space rejoin failed");
                self.rejoin = Some(profile_data);
            }
        }
    }

    fn info(&self) -> SpaceInfo {
        SpaceInfo {
            id: self.id.clone(),
            state: self.tracker.state(),
            generation: self.tracker.generation(),
            member_count: self.tracker.members().map(MemberList::len),
            subscriptions: self.tracker.subscription_count(),
        }
    }
}

async fn resolve_profile<D: MemberDirectory>(
    directory: &D,
    space: &SpaceId,
    client_id: &ClientId,
    timeout: Duration,
) -> ProfileState {
    match tokio::time::timeout(timeout, directory.resolve(client_id)).await {
        Ok(Ok(profile)) => ProfileState::Resolved(profile),
        Ok(Err(e)) => {
            tracing::warn!(%space, %client_id, error = %e, "profile unresolved");
            ProfileState::Unresolved
        }
        Err(_) => {
            tracing::warn!(%space, %client_id, ?timeout, "profile lookup timed out");
            ProfileState::Unresolved
        }
    }
}

/// Fetches the member list and our own record, resolving each distinct
/// user's profile once. The lookups run concurrently.
async fn fetch_snapshot<S, D, L>(
    space: &S,
    directory: Arc<D>,
    resolve_profiles: bool,
    timeout: Duration,
) -> Result<Snapshot<L>, TransportError>
where
    S: RealtimeSpace,
    D: MemberDirectory,
    L: Location,
{
    let wire = space.members().await?;
    let own = space.self_member().await?;

    let mut profiles: HashMap<ClientId, ProfileState> = HashMap::new();
    if resolve_profiles {
        let distinct: HashSet<ClientId> = wire
            .iter()
            .chain(own.iter())
            .map(|m| m.client_id.clone())
            .collect();

        let mut lookups = JoinSet::new();
        for client_id in distinct {
            let directory = Arc::clone(&directory);
            let space_id = space.id().clone();
            lookups.spawn(async move {
                let profile =
                    resolve_profile(directory.as_ref(), &space_id, &client_id, timeout).await;
                (client_id, profile)
            });
        }
        while let Some(joined) = lookups.join_next().await {
            match joined {
                Ok((client_id, profile)) => {
                    profiles.insert(client_id, profile);
                }
                Err(e) => tracing::warn!(space = %space.id(), error = %e, "profile lookup task failed"),
            }
        }
    }
    let profile_of = |client_id: &ClientId| {
        profiles
            .get(client_id)
            .cloned()
            .unwrap_or(ProfileState::Unresolved)
    };

    let members = wire
        .into_iter()
        .map(|m| {
            let profile = profile_of(&m.client_id);
            Member::from_wire(m, profile)
        })
        .collect();
    let self_member = own.map(|m| {
        let profile = profile_of(&m.client_id);
        Member::from_wire(m, profile)
    });

    Ok(Snapshot {
        members,
        self_member,
    })
}

/// Closes the given subscriptions, then leaves. Every step is attempted;
/// the first failure is returned.
async fn teardown<S: RealtimeSpace>(
    space: &S,
    subscriptions: Vec<SubscriptionId>,
) -> Result<(), TransportError> {
    let mut first_error = None;
    for id in subscriptions {
        if let Err(e) = space.unsubscribe(id).await {
            tracing::debug!(space = %space.id(), subscription = %id, error = %e, "unsubscribe failed");
            first_error.get_or_insert(e);
        }
    }
    if let Err(e) = space.leave().await {
        first_error.get_or_insert(e);
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Spawns a Space actor and returns a handle to it.
///
/// `connection` is watched for link loss: the Space drops its list when
/// the link goes and enters again once it is back.
pub(crate) fn spawn_space<S, D, L>(
    space: S,
    directory: Arc<D>,
    connection: watch::Receiver<ConnectionState>,
    self_key: MemberKey,
    config: SpaceConfig,
) -> Space<L>
where
    S: RealtimeSpace,
    D: MemberDirectory,
    L: Location,
{
    let id = space.id().clone();
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));

    let actor = SpaceActor {
        id: id.clone(),
        broadcaster: LocationBroadcaster::new(space.clone()),
        space,
        directory,
        tracker: PresenceTracker::new(id.clone(), self_key),
        config,
        enter_waiters: Vec::new(),
        leave_waiters: Vec::new(),
        lookups: HashSet::new(),
        entered_with: None,
        rejoin: None,
        connection,
        receiver: rx,
        sender: tx.downgrade(),
    };

    tokio::spawn(actor.run());

    Space { id, sender: tx }
}
