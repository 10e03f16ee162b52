//! Core presence types: who is in which Space, and what happened to them.
//!
//! Every type here is serialized with camelCase field names so the JSON
//! matches what browser clients of the same relay already expect
//! (`clientId`, `connectionId`, `lastEvent`, ...).

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtocolError;

/// Milliseconds since the Unix epoch, as carried in [`LastEvent`].
///
/// A clock set before 1970 yields `0` rather than an error; event
/// timestamps are informational and never used for ordering.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Identifies a user. One user may hold several concurrent connections.
///
/// `#[serde(transparent)]` serializes `ClientId("u1")` as plain `"u1"`.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    /// Creates a client id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one concurrent session (tab, device) of a user.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Creates a connection id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The identity of a member inside a Space: user plus session.
///
/// Two tabs of the same user share a `client_id` but never a
/// `connection_id`, so they are two distinct members.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberKey {
    pub client_id: ClientId,
    pub connection_id: ConnectionId,
}

impl MemberKey {
    /// Builds a key from its two halves.
    pub fn new(
        client_id: impl Into<String>,
        connection_id: impl Into<String>,
    ) -> Self {
        Self {
            client_id: ClientId::new(client_id),
            connection_id: ConnectionId::new(connection_id),
        }
    }
}

impl fmt::Display for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client_id, self.connection_id)
    }
}

// ---------------------------------------------------------------------------
// SpaceId
// ---------------------------------------------------------------------------

const WORKSPACE_PREFIX: &str = "workspace:";
const DATABASE_PREFIX: &str = "database:";
const SEPARATOR: char = '|';

/// The name of a Space, which doubles as the transport channel name.
///
/// Either `workspace:<workspaceId>` or
/// `workspace:<workspaceId>|database:<databaseId>`. Ids may not be empty
/// and may not contain `|`, which keeps every (workspace, database) pair
/// mapped to exactly one string.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct SpaceId(String);

impl SpaceId {
    /// The Space for a whole workspace.
    ///
    /// # Errors
    /// Returns [`ProtocolError::InvalidSpaceId`] for an empty id or one
    /// containing `|`.
    pub fn workspace(workspace_id: &str) -> Result<Self, ProtocolError> {
        Self::scoped(workspace_id, None)
    }

    /// The Space for one database view inside a workspace.
    ///
    /// # Errors
    /// Same rules as [`SpaceId::workspace`], applied to both ids.
    pub fn database(
        workspace_id: &str,
        database_id: &str,
    ) -> Result<Self, ProtocolError> {
        Self::scoped(workspace_id, Some(database_id))
    }

    /// Builds a workspace Space, narrowed to a database when one is given.
    ///
    /// # Errors
    /// Same rules as [`SpaceId::workspace`], applied to both ids.
    pub fn scoped(
        workspace_id: &str,
        database_id: Option<&str>,
    ) -> Result<Self, ProtocolError> {
        validate_segment("workspace", workspace_id)?;
        match database_id {
            Some(db) => {
                validate_segment("database", db)?;
                Ok(Self(format!(
                    "{WORKSPACE_PREFIX}{workspace_id}{SEPARATOR}{DATABASE_PREFIX}{db}"
                )))
            }
            None => Ok(Self(format!("{WORKSPACE_PREFIX}{workspace_id}"))),
        }
    }

    /// The full wire string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The workspace part of the id.
    pub fn workspace_id(&self) -> &str {
        let rest = &self.0[WORKSPACE_PREFIX.len()..];
        match rest.split_once(SEPARATOR) {
            Some((ws, _)) => ws,
            None => rest,
        }
    }

    /// The database part of the id, if the Space is database-scoped.
    pub fn database_id(&self) -> Option<&str> {
        self.0
            .split_once(SEPARATOR)
            .map(|(_, db)| &db[DATABASE_PREFIX.len()..])
    }
}

fn validate_segment(kind: &str, id: &str) -> Result<(), ProtocolError> {
    if id.is_empty() {
        return Err(ProtocolError::InvalidSpaceId(format!(
            "{kind} id must not be empty"
        )));
    }
    if id.contains(SEPARATOR) {
        return Err(ProtocolError::InvalidSpaceId(format!(
            "{kind} id {id:?} contains '{SEPARATOR}'"
        )));
    }
    Ok(())
}

impl FromStr for SpaceId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix(WORKSPACE_PREFIX).ok_or_else(|| {
            ProtocolError::InvalidSpaceId(format!(
                "{s:?} does not start with {WORKSPACE_PREFIX:?}"
            ))
        })?;
        match rest.split_once(SEPARATOR) {
            None => Self::workspace(rest),
            Some((ws, scoped)) => {
                let db = scoped.strip_prefix(DATABASE_PREFIX).ok_or_else(|| {
                    ProtocolError::InvalidSpaceId(format!(
                        "{s:?} has an unknown scope after '{SEPARATOR}'"
                    ))
                })?;
                Self::database(ws, db)
            }
        }
    }
}

impl TryFrom<String> for SpaceId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SpaceId> for String {
    fn from(id: SpaceId) -> Self {
        id.0
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// The kind of the last membership event a member went through.
///
/// Transports may grow new kinds (`present`, `remove`, ...). Those are
/// kept as [`EventName::Other`] instead of failing deserialization, so a
/// newer relay never breaks an older client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventName {
    Enter,
    Leave,
    Update,
    Other(String),
}

impl EventName {
    /// The wire spelling of the event kind.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Enter => "enter",
            Self::Leave => "leave",
            Self::Update => "update",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for EventName {
    fn from(name: String) -> Self {
        match name.as_str() {
            "enter" => Self::Enter,
            "leave" => Self::Leave,
            "update" => Self::Update,
            _ => Self::Other(name),
        }
    }
}

impl From<EventName> for String {
    fn from(name: EventName) -> Self {
        match name {
            EventName::Other(name) => name,
            known => known.as_str().to_owned(),
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind and time of a member's most recent membership event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastEvent {
    pub name: EventName,
    /// Unix milliseconds, stamped by the transport.
    pub timestamp: u64,
}

impl LastEvent {
    /// An event of the given kind stamped with the current time.
    pub fn now(name: EventName) -> Self {
        Self {
            name,
            timestamp: unix_millis(),
        }
    }
}

fn default_connected() -> bool {
    true
}

/// A member as the transport reports it.
///
/// Location is carried as a raw JSON value; the Space layer decodes it
/// into the caller's own location type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceMember {
    pub client_id: ClientId,
    pub connection_id: ConnectionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_data: Option<Value>,
    #[serde(default = "default_connected")]
    pub is_connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Value>,
    pub last_event: LastEvent,
}

impl SpaceMember {
    /// The (client, connection) pair identifying this member.
    pub fn key(&self) -> MemberKey {
        MemberKey {
            client_id: self.client_id.clone(),
            connection_id: self.connection_id.clone(),
        }
    }

    /// Returns `true` if this record belongs to `key`.
    pub fn is(&self, key: &MemberKey) -> bool {
        self.client_id == key.client_id
            && self.connection_id == key.connection_id
    }
}

/// A location published by a member, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub member: SpaceMember,
    pub payload: Value,
}

/// Anything a Space subscription can deliver.
///
/// Adjacently tagged:
/// `{ "kind": "member", "data": { "clientId": ... } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum SpaceEvent {
    Member(SpaceMember),
    Location(LocationUpdate),
}

/// What a subscription listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Topic {
    /// Membership lifecycle events (enter, leave, update).
    Members,
    /// Location updates.
    Locations,
}

impl Topic {
    /// Returns `true` if `event` belongs on this topic.
    pub fn carries(self, event: &SpaceEvent) -> bool {
        matches!(
            (self, event),
            (Self::Members, SpaceEvent::Member(_))
                | (Self::Locations, SpaceEvent::Location(_))
        )
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Members => f.write_str("members"),
            Self::Locations => f.write_str("locations"),
        }
    }
}

/// Handle for one subscription, used to unsubscribe exactly it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

// =========================================================================
// Tests
// =========================================================================
