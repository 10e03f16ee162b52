//! The process-wide realtime connection.
//!
//! ```text
//! [Disconnected] ──connect()──→ [Connecting] ──ok──→ [Connected]
//!       ↑                         ↑   │                  │
//!       └───────────err───────────┼───┘                  │
//!       │                         └───link lost──────────┤
//!       └──────────────────close()───────────────────────┘
//! ```
//!
//! Every Space shares one `Connection`. It is constructed explicitly and
//! handed around as an `Arc<Connection<_, _>>`.
//!
//! While connected, a monitor task waits on [`Realtime::closed`]. When the
//! link drops without `close()` it reconnects once (the transport applies
//! its own retry policy) and publishes the new state, so Spaces watching
//! [`subscribe_state`](Connection::subscribe_state) can re-enter.

use std::sync::{Arc, Mutex as StdMutex};

use tether_auth::TokenProvider;
use tether_protocol::MemberKey;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::{Realtime, TransportError};

/// Where the connection is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Connected, appearing in every Space as `key`.
    Connected { key: MemberKey },
}

/// Owns the lifecycle of the single realtime transport handle.
pub struct Connection<R, T> {
    realtime: R,
    tokens: Arc<T>,
    /// Serializes connect/close so concurrent callers coalesce onto one
    /// attempt: the second caller waits here, then sees `Connected`.
    connect_lock: Arc<Mutex<()>>,
    state: Arc<watch::Sender<ConnectionState>>,
    monitor: StdMutex<Option<JoinHandle<()>>>,
}

impl<R: Realtime, T: TokenProvider> Connection<R, T> {
    /// Wraps a transport and the token source it authenticates with.
    /// Nothing is opened until [`connect`](Self::connect).
    pub fn new(realtime: R, tokens: T) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            realtime,
            tokens: Arc::new(tokens),
            connect_lock: Arc::new(Mutex::new(())),
            state: Arc::new(state),
            monitor: StdMutex::new(None),
        }
    }

    /// Ensures the transport is connected and returns our identity.
    ///
    /// Returns immediately if connected and the link is still up. A
    /// `Connected` state whose link has dropped is reconnected here.
    /// Otherwise opens the transport, which calls the token provider as
    /// its authentication callback. Retry, if any, happens inside the
    /// transport; a failure reaching this point is final for this call
    /// and leaves the state at `Disconnected`.
    ///
    /// # Errors
    /// Whatever the transport's `connect` returns, typically
    /// [`TransportError::Auth`] or [`TransportError::ConnectFailed`].
    pub async fn connect(&self) -> Result<MemberKey, TransportError> {
        let _guard = self.connect_lock.lock().await;

        let current = self.state.borrow().clone();
        if let ConnectionState::Connected { key } = current {
            if self.realtime.is_connected() {
                return Ok(key);
            }
            tracing::warn!(member = %key, "realtime link lost, reconnecting");
        }

        let key = open(&self.realtime, &*self.tokens, &self.state).await?;
        self.watch_link();
        Ok(key)
    }

    /// Starts the link monitor, replacing any previous one.
    fn watch_link(&self) {
        let realtime = self.realtime.clone();
        let tokens = Arc::clone(&self.tokens);
        let connect_lock = Arc::clone(&self.connect_lock);
        let state = Arc::clone(&self.state);

        let handle = tokio::spawn(async move {
            loop {
                realtime.closed().await;
                let _guard = connect_lock.lock().await;

                let lost = match &*state.borrow() {
                    ConnectionState::Connected { key } => key.clone(),
                    _ => return,
                };
                if realtime.is_connected() {
                    // Someone reconnected while we waited for the lock.
                    continue;
                }

                tracing::warn!(member = %lost, "realtime link lost, reconnecting");
                if open(&realtime, &*tokens, &state).await.is_err() {
                    return;
                }
            }
        });

        let previous = self
            .monitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn stop_watching(&self) {
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(monitor) = monitor {
            monitor.abort();
        }
    }

    /// The transport handle.
    ///
    /// # Errors
    /// [`TransportError::NotConnected`] before `connect()` has resolved.
    pub fn realtime(&self) -> Result<&R, TransportError> {
        match &*self.state.borrow() {
            ConnectionState::Connected { .. } => Ok(&self.realtime),
            _ => Err(TransportError::NotConnected),
        }
    }

    /// Our identity, if connected.
    pub fn self_key(&self) -> Option<MemberKey> {
        match &*self.state.borrow() {
            ConnectionState::Connected { key } => Some(key.clone()),
            _ => None,
        }
    }

    /// A snapshot of the current state.
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Watches state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Tears the transport handle down. A no-op when not connected.
    ///
    /// # Errors
    /// Propagates the transport's close error; the state is
    /// `Disconnected` either way.
    pub async fn close(&self) -> Result<(), TransportError> {
        let _guard = self.connect_lock.lock().await;

        let was_connected = matches!(
            &*self.state.borrow(),
            ConnectionState::Connected { .. }
        );
        if !was_connected {
            return Ok(());
        }

        self.stop_watching();
        let result = self.realtime.close().await;
        self.state.send_replace(ConnectionState::Disconnected);
        tracing::info!("realtime closed");
        result
    }
}

/// One connect attempt through the transport, publishing each step to
/// `state`. The caller holds the connect lock.
async fn open<R: Realtime, T: TokenProvider>(
    realtime: &R,
    tokens: &T,
    state: &watch::Sender<ConnectionState>,
) -> Result<MemberKey, TransportError> {
    state.send_replace(ConnectionState::Connecting);
    tracing::debug!("realtime connecting");

    match realtime.connect(tokens).await {
        Ok(key) => {
            tracing::info!(
                client_id = %key.client_id,
                connection_id = %key.connection_id,
                "realtime connected"
            );
            state.send_replace(ConnectionState::Connected { key: key.clone() });
            Ok(key)
        }
        Err(e) => {
            tracing::warn!(error = %e, "realtime connect failed");
            state.send_replace(ConnectionState::Disconnected);
            Err(e)
        }
    }
}

impl<R, T> Drop for Connection<R, T> {
    fn drop(&mut self) {
        let monitor = self
            .monitor
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(monitor) = monitor {
            monitor.abort();
        }
    }
}

impl<R, T> std::fmt::Debug for Connection<R, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}
