//! Space registry: resolves Space names to live Space actors.

use std::collections::HashMap;
use std::sync::Arc;

use tether_auth::TokenProvider;
use tether_protocol::SpaceId;
use tether_transport::{Connection, Realtime};
use tokio::sync::{Mutex, OnceCell};

use crate::space::spawn_space;
use crate::{Location, MemberDirectory, Space, SpaceConfig, SpaceError};

/// Tracks every Space this process has resolved.
///
/// Each name maps to at most one live [`Space`]. Concurrent `resolve`
/// calls for the same name share one creation; a creation that fails is
/// not remembered, so the next call starts over.
pub struct SpaceRegistry<R: Realtime, T, D, L> {
    connection: Arc<Connection<R, T>>,
    directory: Arc<D>,
    config: SpaceConfig,
    spaces: Mutex<HashMap<SpaceId, Arc<OnceCell<Space<L>>>>>,
}

impl<R, T, D, L> SpaceRegistry<R, T, D, L>
where
    R: Realtime,
    T: TokenProvider,
    D: MemberDirectory,
    L: Location,
{
    /// Creates an empty registry over a shared connection.
    pub fn new(connection: Arc<Connection<R, T>>, directory: Arc<D>) -> Self {
        Self {
            connection,
            directory,
            config: SpaceConfig::default(),
            spaces: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the configuration for Spaces created from now on.
    pub fn with_config(mut self, config: SpaceConfig) -> Self {
        self.config = config;
        self
    }

    /// The connection every Space is opened on.
    pub fn connection(&self) -> &Arc<Connection<R, T>> {
        &self.connection
    }

    /// Returns the Space for `id`, creating it on first use.
    ///
    /// Creating connects the shared connection if needed, asks the
    /// transport for the Space, and starts its actor. A Space whose actor
    /// has stopped is replaced.
    ///
    /// # Errors
    /// - [`SpaceError::Connection`] if the connection cannot be opened
    /// - [`SpaceError::Resolve`] if the transport cannot produce the Space
    pub async fn resolve(&self, id: &SpaceId) -> Result<Space<L>, SpaceError> {
        let cell = {
            let mut spaces = self.spaces.lock().await;
            let stopped = spaces
                .get(id)
                .and_then(|cell| cell.get())
                .is_some_and(Space::is_closed);
            if stopped {
                tracing::debug!(space = %id, "replacing stopped space");
                spaces.remove(id);
            }
            Arc::clone(spaces.entry(id.clone()).or_default())
        };

        match cell.get_or_try_init(|| self.create(id)).await {
            Ok(space) => Ok(space.clone()),
            Err(e) => {
                let mut spaces = self.spaces.lock().await;
                let ours = spaces
                    .get(id)
                    .is_some_and(|current| Arc::ptr_eq(current, &cell) && !current.initialized());
                if ours {
                    spaces.remove(id);
                }
                Err(e)
            }
        }
    }

    async fn create(&self, id: &SpaceId) -> Result<Space<L>, SpaceError> {
        let self_key = self
            .connection
            .connect()
            .await
            .map_err(SpaceError::Connection)?;
        let realtime = self.connection.realtime().map_err(SpaceError::Connection)?;
        let handle = realtime
            .space(id)
            .await
            .map_err(|source| SpaceError::Resolve {
                space: id.clone(),
                source,
            })?;

        tracing::info!(space = %id, member = %self_key, "space created");
        Ok(spawn_space(
            handle,
            Arc::clone(&self.directory),
            self.connection.subscribe_state(),
            self_key,
            self.config.clone(),
        ))
    }

    /// The Space for `id`, if it has already been resolved.
    pub async fn get(&self, id: &SpaceId) -> Option<Space<L>> {
        self.spaces.lock().await.get(id)?.get().cloned()
    }

    /// Number of resolved Spaces.
    pub async fn len(&self) -> usize {
        self.spaces
            .lock()
            .await
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Names of all resolved Spaces.
    pub async fn space_ids(&self) -> Vec<SpaceId> {
        self.spaces
            .lock()
            .await
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Forgets `id`, leaving it and stopping its actor. Returns `false` if
    /// it was never resolved.
    pub async fn remove(&self, id: &SpaceId) -> bool {
        let removed = self.spaces.lock().await.remove(id);
        match removed.as_deref().and_then(OnceCell::get) {
            Some(space) => {
                let _ = space.shutdown().await;
                tracing::info!(space = %id, "space removed");
                true
            }
            None => false,
        }
    }

    /// Stops every Space. Each one leaves before its actor exits.
    pub async fn shutdown(&self) {
        let cells: Vec<_> = self.spaces.lock().await.drain().collect();
        for (id, cell) in cells {
            if let Some(space) = cell.get() {
                if let Err(e) = space.shutdown().await {
                    tracing::debug!(space = %id, error = %e, "space already stopped");
                }
            }
        }
    }
}

impl<R: Realtime, T, D, L> std::fmt::Debug for SpaceRegistry<R, T, D, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
