//! Credential types: what a token endpoint hands to a client.

use serde::{Deserialize, Serialize};
use tether_protocol::ClientId;

// ---------------------------------------------------------------------------
// IssuerConfig
// ---------------------------------------------------------------------------

/// Configuration for a [`TokenIssuer`](crate::TokenIssuer).
#[derive(Debug, Clone)]
pub struct IssuerConfig {
    /// How long (in seconds) an issued token stays valid.
    ///
    /// Default: 24 hours, the lifetime realtime tokens have always had in
    /// this product. Set to 0 to issue tokens that are already expired
    /// (only useful in tests).
    pub ttl_secs: u64,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
        }
    }
}

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

/// A signed credential usable to open the realtime transport.
///
/// The transport presents `token`; `client_id` is the identity the issuer
/// bound to it, so the client learns who it will appear as in every Space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    /// Opaque bearer token (32 lowercase hex characters).
    pub token: String,

    /// The user this token speaks for.
    pub client_id: ClientId,

    /// Unix milliseconds at issuance.
    pub issued_at: u64,

    /// Unix milliseconds after which the issuer refuses the token.
    pub expires_at: u64,
}

impl Credential {
    /// Returns `true` if `now` (unix ms) is past the expiry stamp.
    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issuer_config_default_is_one_day() {
        assert_eq!(IssuerConfig::default().ttl_secs, 86_400);
    }

    #[test]
    fn test_credential_json_uses_camel_case() {
        let cred = Credential {
            token: "ab".into(),
            client_id: ClientId::new("u1"),
            issued_at: 10,
            expires_at: 20,
        };
        let json = serde_json::to_value(&cred).unwrap();
        assert_eq!(json["clientId"], "u1");
        assert_eq!(json["expiresAt"], 20);
    }

    #[test]
    fn test_credential_is_expired_at_boundary() {
        let cred = Credential {
            token: "ab".into(),
            client_id: ClientId::new("u1"),
            issued_at: 10,
            expires_at: 20,
        };
        assert!(!cred.is_expired_at(19));
        assert!(cred.is_expired_at(20));
    }
}
