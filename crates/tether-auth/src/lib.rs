//! Realtime credentials for Tether.
//!
//! Two sides of the same token:
//!
//! 1. **Acquisition**: the client asks a [`TokenProvider`] for a
//!    [`Credential`] whenever the transport needs to authenticate.
//! 2. **Issuance**: the server mints, validates, and expires credentials
//!    with a [`TokenIssuer`].
//!
//! [`IssuerTokenProvider`] glues the two together in-process, which is what
//! the loopback transport, the demo, and the integration tests use.
//!
//! # How it fits in the stack
//!
//! ```text
//! Transport (above)  ← calls TokenProvider while connecting
//!     ↕
//! Auth (this crate)  ← issues and checks credentials
//!     ↕
//! Protocol (below)   ← provides ClientId
//! ```

mod credential;
mod error;
mod issuer;
mod provider;

pub use credential::{Credential, IssuerConfig};
pub use error::AuthError;
pub use issuer::{SharedIssuer, TokenIssuer};
pub use provider::{IssuerTokenProvider, TokenProvider};
