//! In-process transport talking straight to a [`Hub`].
//!
//! Used when the relay and its clients share a process, and by tests.
//! An optional artificial latency is applied before every request so
//! tests can interleave operations deterministically under paused time.
//!
//! [`LoopbackRealtime::sever`] drops the hub connection without going
//! through `close`, the way a lost network link would.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tether_auth::TokenProvider;
use tether_protocol::{
    MemberKey, SpaceId, SpaceMember, SubscriptionId, Topic, unix_millis,
};

use tokio::sync::watch;

use crate::{EventSink, Hub, Realtime, RealtimeSpace, Subscription, TransportError};

/// The hub connection currently held, shared by every clone and every
/// Space handle.
type Session = Arc<watch::Sender<Option<MemberKey>>>;

/// A [`Realtime`] client bound to an in-process [`Hub`].
#[derive(Clone)]
pub struct LoopbackRealtime {
    hub: Hub,
    latency: Duration,
    session: Session,
}

impl LoopbackRealtime {
    /// A client of `hub` with no added latency.
    pub fn new(hub: Hub) -> Self {
        Self {
            hub,
            latency: Duration::ZERO,
            session: Arc::new(watch::Sender::new(None)),
        }
    }

    /// Delays every request by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// The hub this client talks to.
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    fn session(&self) -> Option<MemberKey> {
        self.session.borrow().clone()
    }

    /// Drops the hub connection as if the link had failed: the hub leaves
    /// every Space for it and [`closed`](Realtime::closed) resolves. The
    /// next `connect` opens a fresh connection.
    pub fn sever(&self) {
        if let Some(key) = self.session.send_replace(None) {
            tracing::debug!(connection_id = %key.connection_id, "loopback link severed");
            self.hub.disconnect(&key.connection_id);
        }
    }
}

impl Realtime for LoopbackRealtime {
    type Space = LoopbackSpace;

    /// Requests one credential and opens a hub connection for its client
    /// id. There is no retry: a failed or expired credential is returned
    /// as [`TransportError::Auth`].
    async fn connect<T: TokenProvider>(
        &self,
        tokens: &T,
    ) -> Result<MemberKey, TransportError> {
        if let Some(key) = self.session() {
            return Ok(key);
        }

        let credential = tokens.request_token().await?;
        if credential.is_expired_at(unix_millis()) {
            return Err(TransportError::Auth(tether_auth::AuthError::Expired(
                credential.client_id,
            )));
        }

        let key = self.hub.open_connection(credential.client_id);
        self.session.send_replace(Some(key.clone()));
        Ok(key)
    }

    async fn space(&self, id: &SpaceId) -> Result<LoopbackSpace, TransportError> {
        if self.session().is_none() {
            return Err(TransportError::NotConnected);
        }
        Ok(LoopbackSpace {
            hub: self.hub.clone(),
            id: id.clone(),
            session: Arc::clone(&self.session),
            latency: self.latency,
        })
    }

    fn is_connected(&self) -> bool {
        self.session().is_some()
    }

    async fn closed(&self) {
        let mut rx = self.session.subscribe();
        let current = rx.borrow_and_update().clone();
        if current.is_none() {
            return;
        }
        // A sender dropped mid-wait also means the link is gone.
        let _ = rx.wait_for(|key| *key != current).await;
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(key) = self.session.send_replace(None) {
            self.hub.disconnect(&key.connection_id);
        }
        Ok(())
    }
}

impl std::fmt::Debug for LoopbackRealtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackRealtime")
            .field("latency", &self.latency)
            .field("session", &self.session())
            .finish()
    }
}

/// One Space of a [`LoopbackRealtime`] connection.
///
/// Acts as whichever hub connection the client currently holds.
#[derive(Clone)]
pub struct LoopbackSpace {
    hub: Hub,
    id: SpaceId,
    session: Session,
    latency: Duration,
}

impl LoopbackSpace {
    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn key(&self) -> Result<MemberKey, TransportError> {
        self.session.borrow().clone().ok_or(TransportError::NotConnected)
    }
}

impl std::fmt::Debug for LoopbackSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackSpace")
            .field("id", &self.id)
            .field("key", &*self.session.borrow())
            .finish()
    }
}

impl RealtimeSpace for LoopbackSpace {
    fn id(&self) -> &SpaceId {
        &self.id
    }

    async fn enter(&self, profile_data: Option<Value>) -> Result<(), TransportError> {
        self.delay().await;
        self.hub.enter(&self.id, &self.key()?, profile_data);
        Ok(())
    }

    async fn leave(&self) -> Result<(), TransportError> {
        self.delay().await;
        self.hub.leave(&self.id, &self.key()?);
        Ok(())
    }

    async fn update_profile(
        &self,
        profile_data: Option<Value>,
    ) -> Result<(), TransportError> {
        self.delay().await;
        self.hub.update_profile(&self.id, &self.key()?, profile_data)?;
        Ok(())
    }

    async fn members(&self) -> Result<Vec<SpaceMember>, TransportError> {
        self.delay().await;
        Ok(self.hub.members(&self.id))
    }

    async fn self_member(&self) -> Result<Option<SpaceMember>, TransportError> {
        self.delay().await;
        Ok(self.hub.member(&self.id, &self.key()?))
    }

    async fn subscribe(
        &self,
        topic: Topic,
        sink: EventSink,
    ) -> Result<Subscription, TransportError> {
        self.delay().await;
        let key = self.key()?;
        Ok(self.hub.subscribe(&self.id, topic, &key.connection_id, sink))
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        self.delay().await;
        self.hub.unsubscribe(&self.id, id);
        Ok(())
    }

    async fn set_location(&self, location: Value) -> Result<(), TransportError> {
        self.delay().await;
        self.hub.set_location(&self.id, &self.key()?, location)
    }
}
