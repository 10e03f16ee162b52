//! Per-Space presence for Tether.
//!
//! Each entered Space runs as an isolated Tokio task (actor model) that
//! owns the Space's member list and its transport subscriptions.
//!
//! # Key types
//!
//! - [`SpaceRegistry`]: resolves a [`SpaceId`](tether_protocol::SpaceId)
//!   to a live [`Space`], creating it at most once
//! - [`Space`]: send commands to a running Space actor
//! - [`PresenceTracker`]: the member-list state machine an actor drives
//! - [`LocationBroadcaster`]: publishes and decodes location payloads
//! - [`MemberDirectory`]: the trait that turns a client id into a
//!   display [`Profile`]
//! - [`SpaceState`]: lifecycle state machine
//! - [`SpaceConfig`]: actor settings

mod config;
mod directory;
mod error;
mod location;
mod members;
mod presence;
mod registry;
mod space;

pub use config::{SpaceConfig, SpaceState};
pub use directory::{DirectoryError, MemberDirectory, Profile, StaticDirectory};
pub use error::SpaceError;
pub use location::{Location, LocationBroadcaster};
pub use members::{Member, MemberList, ProfileState, Upsert};
pub use presence::{Applied, PresenceTracker};
pub use registry::SpaceRegistry;
pub use space::{Space, SpaceInfo};
