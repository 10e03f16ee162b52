//! `RelayServer` builder and server loop.
//!
//! The relay is the authoritative side of the WebSocket transport: it owns
//! the [`Hub`] every client's Space membership lives in, and the
//! [`TokenIssuer`](tether_auth::TokenIssuer) whose credentials clients
//! present when they connect.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tether_auth::{IssuerConfig, SharedIssuer, TokenIssuer};
use tether_protocol::JsonCodec;
use tether_transport::{Hub, WebSocketListener};
use tokio::task::JoinSet;

use crate::TetherError;
use crate::handler::handle_connection;

/// Relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// How long a new socket may take to send `Authenticate`.
    ///
    /// Default: 5 s.
    pub auth_timeout: Duration,

    /// How often expired credentials are swept from the issuer.
    ///
    /// Default: 60 s.
    pub sweep_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Shared relay state passed to each connection handler task.
pub(crate) struct RelayState {
    pub(crate) hub: Hub,
    pub(crate) issuer: SharedIssuer,
    pub(crate) codec: JsonCodec,
    pub(crate) config: RelayConfig,
}

/// Builder for configuring and starting a relay.
///
/// # Example
///
/// ```rust,no_run
/// use tether::prelude::*;
///
/// # async fn run() -> Result<(), TetherError> {
/// let server = RelayServer::builder().bind("0.0.0.0:9400").build().await?;
/// server.run().await
/// # }
/// ```
pub struct RelayServerBuilder {
    bind_addr: String,
    hub: Option<Hub>,
    issuer: Option<SharedIssuer>,
    issuer_config: IssuerConfig,
    config: RelayConfig,
}

impl RelayServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:9400".to_string(),
            hub: None,
            issuer: None,
            issuer_config: IssuerConfig::default(),
            config: RelayConfig::default(),
        }
    }

    /// Sets the address to bind the relay to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    /// Serves an existing hub, e.g. one loopback clients also talk to.
    pub fn hub(mut self, hub: Hub) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Validates credentials against an existing issuer.
    pub fn issuer(mut self, issuer: SharedIssuer) -> Self {
        self.issuer = Some(issuer);
        self
    }

    /// Configures the issuer the relay creates when none is given.
    pub fn issuer_config(mut self, config: IssuerConfig) -> Self {
        self.issuer_config = config;
        self
    }

    /// Sets the relay configuration.
    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    /// Binds the listener.
    ///
    /// # Errors
    /// [`TetherError::Transport`] if the address cannot be bound.
    pub async fn build(self) -> Result<RelayServer, TetherError> {
        let listener = WebSocketListener::bind(&self.bind_addr).await?;

        let state = Arc::new(RelayState {
            hub: self.hub.unwrap_or_default(),
            issuer: self
                .issuer
                .unwrap_or_else(|| TokenIssuer::shared(self.issuer_config)),
            codec: JsonCodec,
            config: self.config,
        });

        Ok(RelayServer { listener, state })
    }
}

impl Default for RelayServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound relay.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct RelayServer {
    listener: WebSocketListener,
    state: Arc<RelayState>,
}

impl RelayServer {
    /// Creates a new builder.
    pub fn builder() -> RelayServerBuilder {
        RelayServerBuilder::new()
    }

    /// Returns the local address the relay is bound to.
    ///
    /// # Errors
    /// [`TetherError::Transport`] if the OS cannot report it.
    pub fn local_addr(&self) -> Result<SocketAddr, TetherError> {
        Ok(self.listener.local_addr()?)
    }

    /// The hub holding every Space's membership.
    pub fn hub(&self) -> &Hub {
        &self.state.hub
    }

    /// The issuer that mints and checks client credentials.
    pub fn issuer(&self) -> &SharedIssuer {
        &self.state.issuer
    }

    /// Runs the accept loop.
    ///
    /// Each accepted socket gets its own handler task. Also sweeps expired
    /// credentials every [`RelayConfig::sweep_interval`]. Runs until the
    /// task is dropped; dropping it also drops every open connection.
    pub async fn run(self) -> Result<(), TetherError> {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "relay running");
        let _sweeper = SweepGuard(tokio::spawn(sweep_credentials(
            Arc::clone(&self.state.issuer),
            self.state.config.sweep_interval,
        )));
        let mut connections = JoinSet::new();

        loop {
            match self.listener.accept().await {
                Ok(peer) => {
                    let state = Arc::clone(&self.state);
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(peer, state).await {
                            tracing::debug!(error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }

            while let Some(finished) = connections.try_join_next() {
                if let Err(e) = finished {
                    tracing::warn!(error = %e, "connection task failed");
                }
            }
        }
    }
}

/// Stops the sweeper when the accept loop goes away.
struct SweepGuard(tokio::task::JoinHandle<()>);

impl Drop for SweepGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Each pass drops what the previous pass expired, then expires what has
/// gone stale since, so a client presenting a just-expired token is told
/// so for one more interval.
async fn sweep_credentials(issuer: SharedIssuer, every: Duration) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let mut issuer = issuer.lock().await;
        issuer.cleanup_expired();
        let expired = issuer.expire_stale();
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired credentials swept");
        }
    }
}
