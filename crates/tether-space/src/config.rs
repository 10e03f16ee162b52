//! Space actor configuration and the Space state machine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// SpaceConfig
// ---------------------------------------------------------------------------

/// Configuration for a Space actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceConfig {
    /// Capacity of the actor's command channel. Event forwarders wait when
    /// it is full, which is the backpressure on a busy Space.
    pub channel_capacity: usize,

    /// Whether members in the entry snapshot get their profiles resolved
    /// through the directory. When off they start `Unresolved` and pick a
    /// profile up with their next `enter` or `update`.
    pub resolve_snapshot_profiles: bool,

    /// How long one directory lookup may take before the member is left
    /// `Unresolved`.
    ///
    /// Default: 5 s.
    pub profile_timeout: Duration,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            resolve_snapshot_profiles: true,
            profile_timeout: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// SpaceState
// ---------------------------------------------------------------------------

/// Whether the local session is in a Space.
///
/// ```text
/// NotEntered → Entering → Entered → Leaving → NotEntered
///                  │                   ↑
///                  └───────────────────┘   (leave aborts an entry)
/// ```
///
/// `Entering → NotEntered` is the rollback when entering fails before
/// anything was published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpaceState {
    NotEntered,
    Entering,
    Entered,
    Leaving,
}

impl SpaceState {
    /// Returns `true` while the session is entering or entered, i.e. while
    /// it may publish a location.
    pub fn is_present(self) -> bool {
        matches!(self, Self::Entering | Self::Entered)
    }

    /// Returns `true` if moving to `target` is a legal transition.
    pub fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::NotEntered, Self::Entering)
                | (Self::Entering, Self::Entered)
                | (Self::Entering, Self::Leaving)
                | (Self::Entering, Self::NotEntered)
                | (Self::Entered, Self::Leaving)
                | (Self::Leaving, Self::NotEntered)
        )
    }
}

impl std::fmt::Display for SpaceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotEntered => write!(f, "NotEntered"),
            Self::Entering => write!(f, "Entering"),
            Self::Entered => write!(f, "Entered"),
            Self::Leaving => write!(f, "Leaving"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_space_state_can_transition_to_follows_lifecycle() {
        use SpaceState::*;
        assert!(NotEntered.can_transition_to(Entering));
        assert!(Entering.can_transition_to(Entered));
        assert!(Entered.can_transition_to(Leaving));
        assert!(Leaving.can_transition_to(NotEntered));
    }

    #[test]
    fn test_space_state_entering_can_abort() {
        assert!(SpaceState::Entering.can_transition_to(SpaceState::Leaving));
        assert!(SpaceState::Entering.can_transition_to(SpaceState::NotEntered));
    }

    #[test]
    fn test_space_state_rejects_skips() {
        use SpaceState::*;
        assert!(!NotEntered.can_transition_to(Entered));
        assert!(!NotEntered.can_transition_to(Leaving));
        assert!(!Leaving.can_transition_to(Entering));
        assert!(!Entered.can_transition_to(Entering));
        assert!(!Entered.can_transition_to(NotEntered));
    }

    #[test]
    fn test_space_state_is_present() {
        assert!(!SpaceState::NotEntered.is_present());
        assert!(SpaceState::Entering.is_present());
        assert!(SpaceState::Entered.is_present());
        assert!(!SpaceState::Leaving.is_present());
    }

    #[test]
    fn test_space_state_display() {
        assert_eq!(SpaceState::NotEntered.to_string(), "NotEntered");
        assert_eq!(SpaceState::Leaving.to_string(), "Leaving");
    }

    #[test]
    fn test_space_config_default() {
        let config = SpaceConfig::default();
        assert_eq!(config.channel_capacity, 64);
        assert!(config.resolve_snapshot_profiles);
        assert_eq!(config.profile_timeout, Duration::from_secs(5));
    }
}
