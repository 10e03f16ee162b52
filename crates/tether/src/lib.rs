//! # Tether
//!
//! Real-time collaborator presence for shared workspaces.
//!
//! Tether keeps, per entered Space (a workspace, optionally narrowed to one
//! database view), a duplicate-free list of who is there and where their
//! cursor is. It reconciles membership and location events arriving
//! concurrently from a pub/sub transport, and ships that transport too: an
//! in-process hub, a WebSocket relay around it, and a WebSocket client.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tether::prelude::*;
//!
//! # async fn run() -> Result<(), TetherError> {
//! // Relay side.
//! let relay = RelayServer::builder().bind("127.0.0.1:9400").build().await?;
//! let tokens = IssuerTokenProvider::new(relay.issuer().clone(), ClientId::new("ada"));
//! tokio::spawn(relay.run());
//!
//! // Client side.
//! let client = PresenceClientBuilder::websocket("ws://127.0.0.1:9400", tokens, StaticDirectory::new())
//!     .build::<serde_json::Value>();
//! client.enter_space("w1", None, None).await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod handler;
mod server;

pub use client::{PresenceClient, PresenceClientBuilder};
pub use error::TetherError;
pub use server::{RelayConfig, RelayServer, RelayServerBuilder};

/// Everything an application usually needs.
pub mod prelude {
    pub use crate::{
        PresenceClient, PresenceClientBuilder, RelayConfig, RelayServer,
        RelayServerBuilder, TetherError,
    };
    pub use tether_auth::{
        Credential, IssuerConfig, IssuerTokenProvider, SharedIssuer, TokenIssuer,
        TokenProvider,
    };
    pub use tether_protocol::{ClientId, MemberKey, SpaceId};
    pub use tether_space::{
        Location, Member, MemberDirectory, Profile, ProfileState, Space,
        SpaceConfig, SpaceState, StaticDirectory,
    };
    pub use tether_transport::{
        Hub, LoopbackRealtime, ReconnectPolicy, WebSocketRealtime,
    };
}

/// Installs a `tracing` subscriber that reads its filter from `RUST_LOG`,
/// defaulting to `info`.
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
