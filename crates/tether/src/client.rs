//! `PresenceClient`: the application-facing facade.
//!
//! Addresses Spaces by workspace and optional database id, and keeps
//! presence out of the host application's way: a Space that cannot be
//! resolved turns `enter_space`, `leave_space` and `set_space_location`
//! into logged no-ops instead of errors.

use std::sync::Arc;

use serde_json::Value;
use tether_auth::TokenProvider;
use tether_protocol::{MemberKey, SpaceId};
use tether_space::{
    Location, Member, MemberDirectory, Space, SpaceConfig, SpaceError, SpaceRegistry,
};
use tether_transport::{Connection, Realtime, WebSocketRealtime};

use crate::TetherError;

/// Builder for a [`PresenceClient`].
///
/// ```rust,no_run
/// use tether::prelude::*;
///
/// # async fn run(tokens: IssuerTokenProvider) -> Result<(), TetherError> {
/// #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
/// struct Cursor { x: i32, y: i32 }
///
/// let client = PresenceClientBuilder::websocket("ws://127.0.0.1:9400", tokens, StaticDirectory::new())
///     .build::<Cursor>();
/// client.enter_space("w1", Some("d1"), None).await?;
/// client.set_space_location("w1", Some("d1"), Cursor { x: 5, y: 2 }).await?;
/// # Ok(())
/// # }
/// ```
pub struct PresenceClientBuilder<R, T, D> {
    realtime: R,
    tokens: T,
    directory: D,
    space_config: SpaceConfig,
}

impl<R, T, D> PresenceClientBuilder<R, T, D>
where
    R: Realtime,
    T: TokenProvider,
    D: MemberDirectory,
{
    /// A client over any transport.
    pub fn new(realtime: R, tokens: T, directory: D) -> Self {
        Self {
            realtime,
            tokens,
            directory,
            space_config: SpaceConfig::default(),
        }
    }

    /// Sets the configuration every Space actor starts with.
    pub fn space_config(mut self, config: SpaceConfig) -> Self {
        self.space_config = config;
        self
    }

    /// Builds the client. Nothing connects until the first Space is used.
    pub fn build<L: Location>(self) -> PresenceClient<R, T, D, L> {
        let connection = Arc::new(Connection::new(self.realtime, self.tokens));
        let registry = SpaceRegistry::new(connection, Arc::new(self.directory))
            .with_config(self.space_config);
        PresenceClient { registry }
    }
}

impl<T, D> PresenceClientBuilder<WebSocketRealtime, T, D>
where
    T: TokenProvider,
    D: MemberDirectory,
{
    /// A client of the relay at `url`, with the default reconnect policy.
    pub fn websocket(url: impl Into<String>, tokens: T, directory: D) -> Self {
        Self::new(WebSocketRealtime::new(url), tokens, directory)
    }
}

/// Presence across every Space this process takes part in.
pub struct PresenceClient<R: Realtime, T, D, L> {
    registry: SpaceRegistry<R, T, D, L>,
}

impl<R, T, D, L> PresenceClient<R, T, D, L>
where
    R: Realtime,
    T: TokenProvider,
    D: MemberDirectory,
    L: Location,
{
    /// The shared connection.
    pub fn connection(&self) -> &Arc<Connection<R, T>> {
        self.registry.connection()
    }

    /// The registry behind this client.
    pub fn registry(&self) -> &SpaceRegistry<R, T, D, L> {
        &self.registry
    }

    /// Connects now instead of on first use.
    ///
    /// # Errors
    /// Whatever the transport's connect returns.
    pub async fn connect(&self) -> Result<MemberKey, TetherError> {
        Ok(self.connection().connect().await?)
    }

    /// The Space for a workspace (and optional database), resolving it if
    /// needed.
    ///
    /// # Errors
    /// - [`TetherError::Protocol`] for a malformed id
    /// - [`TetherError::Space`] if the Space cannot be resolved
    pub async fn space(
        &self,
        workspace_id: &str,
        database_id: Option<&str>,
    ) -> Result<Space<L>, TetherError> {
        let id = SpaceId::scoped(workspace_id, database_id)?;
        Ok(self.registry.resolve(&id).await?)
    }

    /// Enters a Space and waits for its member list.
    ///
    /// Returns `Ok(None)`, after logging, if the Space cannot be resolved.
    ///
    /// # Errors
    /// - [`TetherError::Protocol`] for a malformed id
    /// - [`TetherError::Space`] if entering fails once resolved
    pub async fn enter_space(
        &self,
        workspace_id: &str,
        database_id: Option<&str>,
        profile_data: Option<Value>,
    ) -> Result<Option<Space<L>>, TetherError> {
        let Some(space) = self.resolve_or_skip(workspace_id, database_id).await? else {
            return Ok(None);
        };
        space.enter(profile_data).await?;
        Ok(Some(space))
    }

    /// Leaves a Space. A no-op for a Space that was never resolved.
    ///
    /// # Errors
    /// - [`TetherError::Protocol`] for a malformed id
    /// - [`TetherError::Space`] if the Space actor is gone
    pub async fn leave_space(
        &self,
        workspace_id: &str,
        database_id: Option<&str>,
    ) -> Result<(), TetherError> {
        let id = SpaceId::scoped(workspace_id, database_id)?;
        match self.registry.get(&id).await {
            Some(space) => Ok(space.leave().await?),
            None => {
                tracing::debug!(space = %id, "leave for unresolved space ignored");
                Ok(())
            }
        }
    }

    /// Publishes our location in a Space.
    ///
    /// A logged no-op if the Space cannot be resolved.
    ///
    /// # Errors
    /// - [`TetherError::Protocol`] for a malformed id
    /// - [`TetherError::Space`] if not entered, or the payload does not
    ///   serialize
    pub async fn set_space_location(
        &self,
        workspace_id: &str,
        database_id: Option<&str>,
        location: L,
    ) -> Result<(), TetherError> {
        let Some(space) = self.resolve_or_skip(workspace_id, database_id).await? else {
            return Ok(());
        };
        Ok(space.set_location(location).await?)
    }

    /// The member list of a Space; `None` if it was never resolved or is
    /// not bootstrapped.
    ///
    /// # Errors
    /// - [`TetherError::Protocol`] for a malformed id
    /// - [`TetherError::Space`] if the Space actor is gone
    pub async fn members(
        &self,
        workspace_id: &str,
        database_id: Option<&str>,
    ) -> Result<Option<Vec<Member<L>>>, TetherError> {
        let id = SpaceId::scoped(workspace_id, database_id)?;
        match self.registry.get(&id).await {
            Some(space) => Ok(space.members().await?),
            None => Ok(None),
        }
    }

    /// Our own member record in a Space, if entered.
    ///
    /// # Errors
    /// - [`TetherError::Protocol`] for a malformed id
    /// - [`TetherError::Space`] if the Space actor is gone
    pub async fn self_member(
        &self,
        workspace_id: &str,
        database_id: Option<&str>,
    ) -> Result<Option<Member<L>>, TetherError> {
        let id = SpaceId::scoped(workspace_id, database_id)?;
        match self.registry.get(&id).await {
            Some(space) => Ok(space.self_member().await?),
            None => Ok(None),
        }
    }

    /// Leaves every Space and closes the connection.
    ///
    /// # Errors
    /// [`TetherError::Transport`] if the transport fails to close.
    pub async fn close(&self) -> Result<(), TetherError> {
        self.registry.shutdown().await;
        self.connection().close().await?;
        Ok(())
    }

    async fn resolve_or_skip(
        &self,
        workspace_id: &str,
        database_id: Option<&str>,
    ) -> Result<Option<Space<L>>, TetherError> {
        let id = SpaceId::scoped(workspace_id, database_id)?;
        match self.registry.resolve(&id).await {
            Ok(space) => Ok(Some(space)),
            Err(e @ (SpaceError::Resolve { .. } | SpaceError::Connection(_))) => {
                tracing::warn!(space = %id, error = %e, "space unavailable, presence skipped");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl<R: Realtime, T, D, L> std::fmt::Debug for PresenceClient<R, T, D, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceClient")
            .field("registry", &self.registry)
            .finish()
    }
}
