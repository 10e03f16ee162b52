//! The credential acquisition seam.
//!
//! Tether doesn't know how your application talks to its backend: a
//! REST call with a session cookie, an OAuth bearer token, something
//! else. It only needs a [`Credential`] whenever the transport has to
//! authenticate, so that is the whole trait.

use std::future::Future;

use tether_protocol::ClientId;

use crate::{AuthError, Credential, SharedIssuer};

/// Fetches a fresh realtime credential.
///
/// The transport calls this while connecting (and again on reconnect, if
/// it reconnects). Implementations should not retry internally: the
/// transport owns retry and backoff, and a failure here is reported to it
/// as an authentication failure.
///
/// # Example
///
/// ```rust
/// use tether_auth::{AuthError, Credential, TokenProvider};
///
/// /// Always refuses. Handy for exercising the failure path.
/// struct LoggedOut;
///
/// impl TokenProvider for LoggedOut {
///     async fn request_token(&self) -> Result<Credential, AuthError> {
///         Err(AuthError::Rejected("not logged in".into()))
///     }
/// }
/// ```
pub trait TokenProvider: Send + Sync + 'static {
    /// Requests a credential from the token endpoint.
    ///
    /// # Errors
    /// Returns an [`AuthError`] when no credential can be obtained.
    fn request_token(
        &self,
    ) -> impl Future<Output = Result<Credential, AuthError>> + Send;
}

/// A [`TokenProvider`] that calls a [`TokenIssuer`](crate::TokenIssuer)
/// living in the same process.
///
/// This stands in for the HTTP token endpoint when the relay and the
/// client share a binary (demo, tests).
#[derive(Debug, Clone)]
pub struct IssuerTokenProvider {
    issuer: SharedIssuer,
    client_id: ClientId,
}

impl IssuerTokenProvider {
    /// Issues tokens for `client_id` from `issuer`.
    pub fn new(issuer: SharedIssuer, client_id: ClientId) -> Self {
        Self { issuer, client_id }
    }

    /// The identity every credential from this provider is bound to.
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }
}

impl TokenProvider for IssuerTokenProvider {
    async fn request_token(&self) -> Result<Credential, AuthError> {
        let mut issuer = self.issuer.lock().await;
        Ok(issuer.issue(self.client_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IssuerConfig, TokenIssuer};

    #[tokio::test]
    async fn test_issuer_token_provider_returns_valid_credential() {
        let issuer = TokenIssuer::shared(IssuerConfig::default());
        let provider =
            IssuerTokenProvider::new(issuer.clone(), ClientId::new("u1"));

        let cred = provider.request_token().await.unwrap();

        let validated = issuer.lock().await.validate(&cred.token).unwrap();
        assert_eq!(validated, ClientId::new("u1"));
        assert_eq!(provider.client_id(), &ClientId::new("u1"));
    }
}
