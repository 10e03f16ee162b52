//! The token issuer: mints and checks realtime credentials.
//!
//! This is the server side of the token endpoint. It is responsible for:
//! - Minting a random token bound to a client id
//! - Validating tokens presented by connecting clients
//! - Expiring tokens after their TTL
//! - Cleaning up dead grants to free memory
//!
//! # Concurrency note
//!
//! `TokenIssuer` is NOT thread-safe by itself; it uses a plain `HashMap`.
//! Share it as a [`SharedIssuer`] (`Arc<tokio::sync::Mutex<_>>`) and hold
//! the lock only for the duration of one call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tether_protocol::{ClientId, unix_millis};
use tokio::sync::Mutex;

use crate::{AuthError, Credential, IssuerConfig};

/// An issuer shared between the relay's connection handlers and whatever
/// serves the token endpoint.
pub type SharedIssuer = Arc<Mutex<TokenIssuer>>;

/// Lifecycle of one issued token.
///
/// ```text
/// issue() ──→ [Active] ──(ttl elapsed)──→ [Expired] ──→ cleanup_expired()
///                │
///                └──(revoke)──→ removed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GrantState {
    Active,
    Expired,
}

#[derive(Debug, Clone)]
struct Grant {
    client_id: ClientId,
    issued: Instant,
    state: GrantState,
}

/// Mints and validates realtime credentials.
#[derive(Debug)]
pub struct TokenIssuer {
    /// Every grant still remembered, keyed by token.
    grants: HashMap<String, Grant>,

    config: IssuerConfig,
}

impl TokenIssuer {
    /// Creates an issuer with no outstanding grants.
    pub fn new(config: IssuerConfig) -> Self {
        Self {
            grants: HashMap::new(),
            config,
        }
    }

    /// Wraps a fresh issuer for sharing across tasks.
    pub fn shared(config: IssuerConfig) -> SharedIssuer {
        Arc::new(Mutex::new(Self::new(config)))
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_secs)
    }

    /// Issues a new credential for `client_id`.
    ///
    /// A user may hold any number of live tokens at once (one per tab or
    /// device), so issuing never invalidates an earlier token.
    pub fn issue(&mut self, client_id: ClientId) -> Credential {
        let token = generate_token();
        let issued_at = unix_millis();
        let expires_at = issued_at + self.config.ttl_secs * 1000;

        self.grants.insert(
            token.clone(),
            Grant {
                client_id: client_id.clone(),
                issued: Instant::now(),
                state: GrantState::Active,
            },
        );

        tracing::info!(%client_id, ttl_secs = self.config.ttl_secs, "credential issued");

        Credential {
            token,
            client_id,
            issued_at,
            expires_at,
        }
    }

    /// Checks a presented token and returns the client it speaks for.
    ///
    /// # Errors
    /// - [`AuthError::InvalidToken`]: never issued, revoked, or cleaned up
    /// - [`AuthError::Expired`]: the TTL has elapsed
    pub fn validate(&mut self, token: &str) -> Result<ClientId, AuthError> {
        let ttl = self.ttl();
        let grant = self
            .grants
            .get_mut(token)
            .ok_or(AuthError::InvalidToken)?;

        if grant.state == GrantState::Active && grant.issued.elapsed() >= ttl {
            grant.state = GrantState::Expired;
        }

        match grant.state {
            GrantState::Active => Ok(grant.client_id.clone()),
            GrantState::Expired => {
                Err(AuthError::Expired(grant.client_id.clone()))
            }
        }
    }

    /// Forgets a token immediately. Returns `false` if it was unknown.
    pub fn revoke(&mut self, token: &str) -> bool {
        let removed = self.grants.remove(token);
        if let Some(grant) = &removed {
            tracing::info!(client_id = %grant.client_id, "credential revoked");
        }
        removed.is_some()
    }

    /// Marks every grant past its TTL as expired.
    ///
    /// Returns the client ids whose tokens expired in this pass.
    pub fn expire_stale(&mut self) -> Vec<ClientId> {
        let ttl = self.ttl();
        let mut expired = Vec::new();

        for grant in self.grants.values_mut() {
            if grant.state == GrantState::Active && grant.issued.elapsed() >= ttl
            {
                grant.state = GrantState::Expired;
                expired.push(grant.client_id.clone());
                tracing::debug!(client_id = %grant.client_id, "credential expired");
            }
        }

        expired
    }

    /// Removes all expired grants.
    ///
    /// Kept separate from [`expire_stale`](Self::expire_stale) so a caller
    /// can still report "expired" (rather than "invalid") to a client
    /// that presents a token between the two calls.
    pub fn cleanup_expired(&mut self) {
        self.grants
            .retain(|_, grant| grant.state != GrantState::Expired);
    }

    /// Number of remembered grants (any state).
    pub fn len(&self) -> usize {
        self.grants.len()
    }

    /// Returns `true` if no grants are remembered.
    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

impl Default for TokenIssuer {
    fn default() -> Self {
        Self::new(IssuerConfig::default())
    }
}

/// Generates a random 32-character hex string (128 bits of entropy).
fn generate_token() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 16] = rng.random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// =========================================================================
// Tests
// =========================================================================
