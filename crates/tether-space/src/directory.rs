//! The member directory seam: client id in, display profile out.
//!
//! Resolution is best-effort. A failure never keeps a member out of the
//! list; it is listed with [`ProfileState::Unresolved`](crate::ProfileState)
//! instead.

use std::collections::HashMap;
use std::future::Future;

use serde::{Deserialize, Serialize};
use tether_protocol::ClientId;

/// The display profile of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub client_id: ClientId,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub display_name: String,
    pub initials: String,
    /// Avatar URL, if the user set one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl Profile {
    /// A profile with the name fields derived from `first` and `last`.
    pub fn new(client_id: ClientId, email: &str, first: &str, last: &str) -> Self {
        let initials = first
            .chars()
            .next()
            .into_iter()
            .chain(last.chars().next())
            .flat_map(char::to_uppercase)
            .collect();
        Self {
            client_id,
            email: email.to_owned(),
            first_name: first.to_owned(),
            last_name: last.to_owned(),
            display_name: format!("{first} {last}").trim().to_owned(),
            initials,
            avatar: None,
        }
    }

    /// Sets the avatar URL.
    pub fn with_avatar(mut self, url: impl Into<String>) -> Self {
        self.avatar = Some(url.into());
        self
    }
}

/// Why a profile could not be resolved.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    /// The directory has never heard of this user.
    #[error("no profile for client {0}")]
    NotFound(ClientId),

    /// The directory could not be queried.
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// Resolves a client id into a display profile.
///
/// Implementations usually sit on a cache in front of the users API. The
/// Space layer calls this from spawned tasks, never from its actor loop,
/// so a slow lookup only delays that member's profile. Each call is
/// bounded by [`SpaceConfig::profile_timeout`](crate::SpaceConfig) and
/// never retried.
pub trait MemberDirectory: Send + Sync + 'static {
    /// Looks up `client_id`.
    ///
    /// # Errors
    /// A [`DirectoryError`] when no profile can be produced.
    fn resolve(
        &self,
        client_id: &ClientId,
    ) -> impl Future<Output = Result<Profile, DirectoryError>> + Send;
}

/// A fixed in-memory directory.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    profiles: HashMap<ClientId, Profile>,
}

impl StaticDirectory {
    /// An empty directory: every lookup fails with `NotFound`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a profile, builder style.
    pub fn with(mut self, profile: Profile) -> Self {
        self.insert(profile);
        self
    }

    /// Adds (or replaces) a profile.
    pub fn insert(&mut self, profile: Profile) {
        self.profiles.insert(profile.client_id.clone(), profile);
    }
}

impl MemberDirectory for StaticDirectory {
    async fn resolve(&self, client_id: &ClientId) -> Result<Profile, DirectoryError> {
        self.profiles
            .get(client_id)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(client_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_new_derives_display_name_and_initials() {
        let profile = Profile::new(ClientId::new("u1"), "ada@example.com", "ada", "lovelace");
        assert_eq!(profile.display_name, "ada lovelace");
        assert_eq!(profile.initials, "AL");
        assert_eq!(profile.avatar, None);
    }

    #[test]
    fn test_profile_new_without_last_name() {
        let profile = Profile::new(ClientId::new("u1"), "", "Plato", "");
        assert_eq!(profile.display_name, "Plato");
        assert_eq!(profile.initials, "P");
    }

    #[test]
    fn test_profile_json_uses_camel_case() {
        let profile = Profile::new(ClientId::new("u1"), "a@b.c", "A", "B")
            .with_avatar("https://img/1.png");
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["clientId"], "u1");
        assert_eq!(json["displayName"], "A B");
        assert_eq!(json["avatar"], "https://img/1.png");
    }

    #[tokio::test]
    async fn test_static_directory_resolve_known_and_unknown() {
        let directory = StaticDirectory::new()
            .with(Profile::new(ClientId::new("u1"), "", "Ada", "L"));

        let found = directory.resolve(&ClientId::new("u1")).await.unwrap();
        assert_eq!(found.display_name, "Ada L");

        let missing = directory.resolve(&ClientId::new("u2")).await;
        assert!(matches!(missing, Err(DirectoryError::NotFound(ref c)) if c.as_str() == "u2"));
    }
}
