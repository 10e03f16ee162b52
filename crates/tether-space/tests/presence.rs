//! Integration tests: Space actors on loopback connections sharing a hub.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tether_auth::{
    AuthError, Credential, IssuerConfig, IssuerTokenProvider, TokenIssuer, TokenProvider,
};
use tether_protocol::{ClientId, EventName, MemberKey, SpaceId};
use tether_space::{
    DirectoryError, Member, MemberDirectory, Profile, ProfileState, Space, SpaceConfig,
    SpaceError, SpaceRegistry, SpaceState, StaticDirectory,
};
use tether_transport::{Connection, ConnectionState, Hub, LoopbackRealtime};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Cursor {
    x: i32,
    y: i32,
}

type Registry<T = IssuerTokenProvider> =
    SpaceRegistry<LoopbackRealtime, T, StaticDirectory, Cursor>;

fn doc() -> SpaceId {
    SpaceId::database("W1", "D1").unwrap()
}

fn directory() -> StaticDirectory {
    StaticDirectory::new()
        .with(Profile::new(ClientId::new("ada"), "ada@example.com", "Ada", "Lovelace"))
        .with(Profile::new(ClientId::new("bob"), "bob@example.com", "Bob", "Kahn"))
}

fn tokens(user: &str) -> IssuerTokenProvider {
    IssuerTokenProvider::new(
        TokenIssuer::shared(IssuerConfig::default()),
        ClientId::new(user),
    )
}

fn registry_with<T: TokenProvider>(
    hub: &Hub,
    tokens: T,
    latency: Duration,
) -> Registry<T> {
    let realtime = LoopbackRealtime::new(hub.clone()).with_latency(latency);
    SpaceRegistry::new(
        Arc::new(Connection::new(realtime, tokens)),
        Arc::new(directory()),
    )
}

fn registry(hub: &Hub, user: &str) -> Registry {
    registry_with(hub, tokens(user), Duration::ZERO)
}

/// A registry whose profiles come from `directory`.
fn registry_over<D: MemberDirectory>(
    hub: &Hub,
    user: &str,
    directory: D,
    config: SpaceConfig,
) -> SpaceRegistry<LoopbackRealtime, IssuerTokenProvider, D, Cursor> {
    let realtime = LoopbackRealtime::new(hub.clone());
    SpaceRegistry::new(
        Arc::new(Connection::new(realtime, tokens(user))),
        Arc::new(directory),
    )
    .with_config(config)
}

/// Never answers for `stuck`; everyone else resolves normally.
struct StuckDirectory {
    stuck: ClientId,
    inner: StaticDirectory,
}

impl MemberDirectory for StuckDirectory {
    async fn resolve(&self, client_id: &ClientId) -> Result<Profile, DirectoryError> {
        if client_id == &self.stuck {
            std::future::pending::<()>().await;
        }
        self.inner.resolve(client_id).await
    }
}

/// Answers every lookup after `delay`.
struct SlowDirectory {
    delay: Duration,
    inner: StaticDirectory,
}

impl MemberDirectory for SlowDirectory {
    async fn resolve(&self, client_id: &ClientId) -> Result<Profile, DirectoryError> {
        tokio::time::sleep(self.delay).await;
        self.inner.resolve(client_id).await
    }
}

/// Polls the member list until `ready` accepts it.
async fn members_when(
    space: &Space<Cursor>,
    ready: impl Fn(&[Member<Cursor>]) -> bool,
) -> Vec<Member<Cursor>> {
    for _ in 0..500 {
        if let Some(members) = space.members().await.unwrap() {
            if ready(&members) {
                return members;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("member list never reached the expected shape");
}

fn find<'a>(members: &'a [Member<Cursor>], user: &str) -> Option<&'a Member<Cursor>> {
    members.iter().find(|m| m.client_id() == &ClientId::new(user))
}

/// Fails the first `failures` requests, then issues real credentials.
struct FlakyTokens {
    inner: IssuerTokenProvider,
    failures: AtomicUsize,
}

impl TokenProvider for FlakyTokens {
    async fn request_token(&self) -> Result<Credential, AuthError> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(AuthError::Unavailable("token endpoint down".into()));
        }
        self.inner.request_token().await
    }
}

// ---------------------------------------------------------------------------
// Entering and the member list
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_enter_bootstraps_list_with_self() {
    let hub = Hub::new();
    let ada = registry(&hub, "ada");
    let space = ada.resolve(&doc()).await.unwrap();
    assert_eq!(space.members().await.unwrap(), None);

    space.enter(Some(json!({ "color": "red" }))).await.unwrap();

    let members = space.members().await.unwrap().unwrap();
    assert_eq!(members.len(), 1);
    let me = space.self_member().await.unwrap().unwrap();
    assert_eq!(me.client_id(), &ClientId::new("ada"));
    assert_eq!(me.profile_data, Some(json!({ "color": "red" })));
    assert_eq!(
        me.profile.profile().map(|p| p.display_name.as_str()),
        Some("Ada Lovelace")
    );

    let info = space.info().await.unwrap();
    assert_eq!(info.state, SpaceState::Entered);
    assert_eq!(info.member_count, Some(1));
    assert_eq!(info.subscriptions, 2);
    assert_eq!(hub.subscription_count(&doc()), 2);
}

#[tokio::test]
async fn test_enter_twice_is_a_no_op() {
    let hub = Hub::new();
    let space = registry(&hub, "ada").resolve(&doc()).await.unwrap();

    space.enter(None).await.unwrap();
    space.enter(None).await.unwrap();

    let info = space.info().await.unwrap();
    assert_eq!(info.generation, 1);
    assert_eq!(hub.subscription_count(&doc()), 2);
}

#[tokio::test]
async fn test_two_users_see_each_other_and_locations() {
    let hub = Hub::new();
    let ada = registry(&hub, "ada").resolve(&doc()).await.unwrap();
    let bob = registry(&hub, "bob").resolve(&doc()).await.unwrap();
    ada.enter(None).await.unwrap();
    bob.enter(None).await.unwrap();

    // Bob's snapshot already has Ada; Ada learns of Bob from his enter.
    let seen_by_bob = bob.members().await.unwrap().unwrap();
    assert_eq!(seen_by_bob.len(), 2);
    let seen_by_ada = members_when(&ada, |m| {
        m.len() == 2 && find(m, "bob").is_some_and(|b| b.profile.is_resolved())
    })
    .await;
    let bob_there = find(&seen_by_ada, "bob").unwrap();
    assert_eq!(
        bob_there.profile.profile().map(|p| p.initials.as_str()),
        Some("BK")
    );

    bob.set_location(Cursor { x: 3, y: 4 }).await.unwrap();

    let seen_by_ada = members_when(&ada, |m| {
        find(m, "bob").is_some_and(|b| b.location.is_some())
    })
    .await;
    assert_eq!(
        find(&seen_by_ada, "bob").unwrap().location,
        Some(Cursor { x: 3, y: 4 })
    );
    assert_eq!(seen_by_ada.len(), 2);

    // Our own location comes back through the subscription too.
    members_when(&bob, |m| {
        find(m, "bob").is_some_and(|b| b.location == Some(Cursor { x: 3, y: 4 }))
    })
    .await;
    let me = bob.self_member().await.unwrap().unwrap();
    assert_eq!(me.location, Some(Cursor { x: 3, y: 4 }));
}

#[tokio::test]
async fn test_member_leave_removes_only_that_member() {
    let hub = Hub::new();
    let ada = registry(&hub, "ada").resolve(&doc()).await.unwrap();
    let bob = registry(&hub, "bob").resolve(&doc()).await.unwrap();
    ada.enter(None).await.unwrap();
    bob.enter(None).await.unwrap();
    members_when(&ada, |m| m.len() == 2).await;

    bob.leave().await.unwrap();

    let remaining = members_when(&ada, |m| m.len() == 1).await;
    assert_eq!(remaining[0].client_id(), &ClientId::new("ada"));
    assert_eq!(bob.members().await.unwrap(), None);
    assert_eq!(bob.self_member().await.unwrap(), None);
}

#[tokio::test]
async fn test_update_profile_replaces_member_in_place() {
    let hub = Hub::new();
    let ada = registry(&hub, "ada").resolve(&doc()).await.unwrap();
    let bob = registry(&hub, "bob").resolve(&doc()).await.unwrap();
    ada.enter(None).await.unwrap();
    bob.enter(Some(json!({ "color": "blue" }))).await.unwrap();
    members_when(&ada, |m| m.len() == 2).await;

    bob.update_profile(Some(json!({ "color": "green" }))).await.unwrap();

    let members = members_when(&ada, |m| {
        find(m, "bob").is_some_and(|b| {
            b.last_event.name == EventName::Update && b.profile.is_resolved()
        })
    })
    .await;
    assert_eq!(members.len(), 2);
    let bob_there = find(&members, "bob").unwrap();
    assert_eq!(bob_there.profile_data, Some(json!({ "color": "green" })));
    assert!(bob_there.profile.is_resolved());
}

#[tokio::test]
async fn test_unknown_profile_member_is_listed_unresolved() {
    let hub = Hub::new();
    let ada = registry(&hub, "ada").resolve(&doc()).await.unwrap();
    let cy = registry(&hub, "cy").resolve(&doc()).await.unwrap();
    ada.enter(None).await.unwrap();

    cy.enter(None).await.unwrap();

    let members = members_when(&ada, |m| m.len() == 2).await;
    assert_eq!(find(&members, "cy").unwrap().profile, ProfileState::Unresolved);
}

#[tokio::test]
async fn test_second_connection_of_same_user_is_a_separate_member() {
    let hub = Hub::new();
    let ada = registry(&hub, "ada").resolve(&doc()).await.unwrap();
    let ada_again = registry(&hub, "ada").resolve(&doc()).await.unwrap();
    ada.enter(None).await.unwrap();
    ada_again.enter(None).await.unwrap();

    let members = members_when(&ada, |m| m.len() == 2).await;
    let keys: Vec<MemberKey> = members.iter().map(|m| m.key.clone()).collect();
    assert_ne!(keys[0], keys[1]);

    ada_again.leave().await.unwrap();
    let members = members_when(&ada, |m| m.len() == 1).await;
    assert_eq!(Some(&members[0]), ada.self_member().await.unwrap().as_ref());
}

#[tokio::test]
async fn test_set_location_before_enter_returns_not_entered() {
    let hub = Hub::new();
    let space = registry(&hub, "ada").resolve(&doc()).await.unwrap();

    let result = space.set_location(Cursor { x: 0, y: 0 }).await;
    assert!(matches!(result, Err(SpaceError::NotEntered(_))));

    let result = space.update_profile(None).await;
    assert!(matches!(result, Err(SpaceError::NotEntered(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rapid_member_and_location_events_apply_in_publish_order() {
    let hub = Hub::new();
    let ada = registry(&hub, "ada").resolve(&doc()).await.unwrap();
    ada.enter(None).await.unwrap();

    let bob = hub.open_connection(ClientId::new("bob"));
    for i in 0..200 {
        hub.enter(&doc(), &bob, None);
        hub.set_location(&doc(), &bob, json!({ "x": i, "y": i })).unwrap();
        hub.leave(&doc(), &bob);
    }
    let cy = hub.open_connection(ClientId::new("cy"));
    hub.enter(&doc(), &cy, None);

    // Cy entered last, so once Cy is listed every earlier event is applied.
    let members = members_when(&ada, |m| find(m, "cy").is_some()).await;
    assert!(find(&members, "bob").is_none(), "bob left but is listed: {members:?}");
    assert_eq!(members.len(), 2);
}

// ---------------------------------------------------------------------------
// Profile lookups
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stuck_directory_does_not_block_members_or_leave() {
    let hub = Hub::new();
    let stuck = StuckDirectory {
        stuck: ClientId::new("bob"),
        inner: directory(),
    };
    let ada = registry_over(&hub, "ada", stuck, SpaceConfig::default())
        .resolve(&doc())
        .await
        .unwrap();
    ada.enter(None).await.unwrap();

    let bob = registry(&hub, "bob").resolve(&doc()).await.unwrap();
    bob.enter(None).await.unwrap();

    let members = tokio::time::timeout(
        Duration::from_secs(2),
        members_when(&ada, |m| m.len() == 2),
    )
    .await
    .expect("member list blocked on the directory");
    assert_eq!(find(&members, "bob").unwrap().profile, ProfileState::Unresolved);
    assert!(find(&members, "ada").unwrap().profile.is_resolved());

    tokio::time::timeout(Duration::from_secs(2), ada.leave())
        .await
        .expect("leave blocked on the directory")
        .unwrap();
    assert_eq!(ada.members().await.unwrap(), None);
}

#[tokio::test]
async fn test_stuck_directory_snapshot_lookup_times_out() {
    let hub = Hub::new();
    let bob = registry(&hub, "bob").resolve(&doc()).await.unwrap();
    bob.enter(None).await.unwrap();

    let stuck = StuckDirectory {
        stuck: ClientId::new("bob"),
        inner: directory(),
    };
    let config = SpaceConfig {
        profile_timeout: Duration::from_millis(100),
        ..SpaceConfig::default()
    };
    let ada = registry_over(&hub, "ada", stuck, config)
        .resolve(&doc())
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), ada.enter(None))
        .await
        .expect("enter blocked on the directory")
        .unwrap();

    let members = ada.members().await.unwrap().unwrap();
    assert_eq!(members.len(), 2);
    assert_eq!(find(&members, "bob").unwrap().profile, ProfileState::Unresolved);
}

#[tokio::test(start_paused = true)]
async fn test_slow_directory_profile_is_patched_in_later() {
    let hub = Hub::new();
    let slow = SlowDirectory {
        delay: Duration::from_secs(1),
        inner: directory(),
    };
    let ada = registry_over(&hub, "ada", slow, SpaceConfig::default())
        .resolve(&doc())
        .await
        .unwrap();
    ada.enter(None).await.unwrap();

    let bob = registry(&hub, "bob").resolve(&doc()).await.unwrap();
    bob.enter(None).await.unwrap();

    let first = members_when(&ada, |m| m.len() == 2).await;
    assert_eq!(find(&first, "bob").unwrap().profile, ProfileState::Unresolved);

    let later = members_when(&ada, |m| {
        find(m, "bob").is_some_and(|b| b.profile.is_resolved())
    })
    .await;
    assert_eq!(
        find(&later, "bob").unwrap().profile.profile().map(|p| p.initials.as_str()),
        Some("BK")
    );
}

// ---------------------------------------------------------------------------
// Link loss
// ---------------------------------------------------------------------------

/// Polls until our own record shows a connection other than `old`.
async fn rejoined(space: &Space<Cursor>, old: &MemberKey) -> Member<Cursor> {
    for _ in 0..500 {
        if let Some(me) = space.self_member().await.unwrap() {
            if &me.key != old {
                return me;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("space never rejoined");
}

#[tokio::test]
async fn test_link_loss_rejoins_with_new_connection() {
    let hub = Hub::new();
    let ada = registry(&hub, "ada");
    let space = ada.resolve(&doc()).await.unwrap();
    space.enter(Some(json!({ "color": "red" }))).await.unwrap();
    let bob = registry(&hub, "bob").resolve(&doc()).await.unwrap();
    bob.enter(None).await.unwrap();
    let old = space.self_member().await.unwrap().unwrap().key;

    ada.connection().realtime().unwrap().sever();

    let me = rejoined(&space, &old).await;
    assert_eq!(me.client_id(), &ClientId::new("ada"));
    assert_eq!(space.info().await.unwrap().state, SpaceState::Entered);
    let members = members_when(&space, |m| m.len() == 2).await;
    assert!(find(&members, "bob").is_some());

    // Bob sees Ada's new connection, entered with the same profile data.
    let seen_by_bob = members_when(&bob, |m| {
        find(m, "ada").is_some_and(|a| a.key == me.key)
    })
    .await;
    assert_eq!(seen_by_bob.len(), 2);
    assert_eq!(
        find(&seen_by_bob, "ada").unwrap().profile_data,
        Some(json!({ "color": "red" }))
    );
    assert_eq!(hub.member_count(&doc()), 2);
    assert_eq!(hub.subscription_count(&doc()), 4);
}

#[tokio::test]
async fn test_link_loss_after_leave_does_not_rejoin() {
    let hub = Hub::new();
    let ada = registry(&hub, "ada");
    let space = ada.resolve(&doc()).await.unwrap();
    space.enter(None).await.unwrap();
    space.leave().await.unwrap();
    let old = ada.connection().self_key().unwrap();
    let mut state = ada.connection().subscribe_state();

    ada.connection().realtime().unwrap().sever();
    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|s| matches!(s, ConnectionState::Connected { key } if *key != old)),
    )
    .await
    .expect("connection never came back")
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(space.info().await.unwrap().state, SpaceState::NotEntered);
    assert_eq!(hub.member_count(&doc()), 0);
}

// ---------------------------------------------------------------------------
// Lifecycle races (slow transport, paused clock)
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_leave_while_entering_aborts_enter() {
    let hub = Hub::new();
    let ada = registry_with(&hub, tokens("ada"), Duration::from_millis(50));
    let space = ada.resolve(&doc()).await.unwrap();

    let entering = tokio::spawn({
        let space = space.clone();
        async move { space.enter(None).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    space.leave().await.unwrap();

    let result = entering.await.unwrap();
    assert!(matches!(result, Err(SpaceError::EnterAborted(_))));
    assert_eq!(hub.member_count(&doc()), 0);
    assert_eq!(hub.subscription_count(&doc()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_arriving_after_leave_is_discarded() {
    let hub = Hub::new();
    let ada = registry_with(&hub, tokens("ada"), Duration::from_millis(50));
    let space = ada.resolve(&doc()).await.unwrap();

    let entering = tokio::spawn({
        let space = space.clone();
        async move { space.enter(None).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    space.leave().await.unwrap();
    let _ = entering.await.unwrap();

    // Long after the snapshot fetch finished.
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(space.members().await.unwrap(), None);
    assert_eq!(space.self_member().await.unwrap(), None);
    let info = space.info().await.unwrap();
    assert_eq!(info.state, SpaceState::NotEntered);
    assert_eq!(info.subscriptions, 0);
}

#[tokio::test(start_paused = true)]
async fn test_enter_while_leaving_is_rejected() {
    let hub = Hub::new();
    let ada = registry_with(&hub, tokens("ada"), Duration::from_millis(50));
    let space = ada.resolve(&doc()).await.unwrap();
    space.enter(None).await.unwrap();

    let leaving = tokio::spawn({
        let space = space.clone();
        async move { space.leave().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let result = space.enter(None).await;
    assert!(matches!(result, Err(SpaceError::Leaving(_))));

    leaving.await.unwrap().unwrap();
    space.enter(None).await.unwrap();
    assert_eq!(space.info().await.unwrap().state, SpaceState::Entered);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_enter_leave_cycles_leak_nothing() {
    let hub = Hub::new();
    let ada = registry_with(&hub, tokens("ada"), Duration::from_millis(5));
    let space = ada.resolve(&doc()).await.unwrap();

    for _ in 0..5 {
        space.enter(None).await.unwrap();
        space.set_location(Cursor { x: 1, y: 1 }).await.unwrap();
        space.leave().await.unwrap();
    }

    let info = space.info().await.unwrap();
    assert_eq!(info.generation, 10);
    assert_eq!(info.subscriptions, 0);
    assert_eq!(info.member_count, None);
    assert_eq!(hub.subscription_count(&doc()), 0);
    assert_eq!(hub.member_count(&doc()), 0);
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_registry_concurrent_resolves_share_one_space() {
    let hub = Hub::new();
    let ada = registry(&hub, "ada");

    let id = doc();
    let (a, b, c) = tokio::join!(ada.resolve(&id), ada.resolve(&id), ada.resolve(&id));
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

    a.enter(None).await.unwrap();

    assert_eq!(b.info().await.unwrap().state, SpaceState::Entered);
    assert_eq!(c.info().await.unwrap().generation, 1);
    assert_eq!(ada.len().await, 1);
    assert_eq!(ada.space_ids().await, vec![doc()]);
}

#[tokio::test]
async fn test_registry_failed_resolve_is_not_cached() {
    let hub = Hub::new();
    let flaky = FlakyTokens {
        inner: tokens("ada"),
        failures: AtomicUsize::new(1),
    };
    let ada = registry_with(&hub, flaky, Duration::ZERO);

    let first = ada.resolve(&doc()).await;
    assert!(matches!(first, Err(SpaceError::Connection(_))));
    assert!(ada.is_empty().await);
    assert!(ada.get(&doc()).await.is_none());

    let space = ada.resolve(&doc()).await.unwrap();
    space.enter(None).await.unwrap();
    assert_eq!(ada.len().await, 1);
}

#[tokio::test]
async fn test_registry_remove_leaves_and_forgets() {
    let hub = Hub::new();
    let ada = registry(&hub, "ada");
    let space = ada.resolve(&doc()).await.unwrap();
    space.enter(None).await.unwrap();
    assert_eq!(hub.member_count(&doc()), 1);

    assert!(ada.remove(&doc()).await);

    assert_eq!(hub.member_count(&doc()), 0);
    assert_eq!(hub.subscription_count(&doc()), 0);
    assert!(ada.is_empty().await);
    assert!(!ada.remove(&doc()).await);

    let fresh = ada.resolve(&doc()).await.unwrap();
    assert_eq!(fresh.info().await.unwrap().generation, 0);
}
