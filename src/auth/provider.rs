//! Credential providers for the authentication handshake.
//!
//! The handshake asks the provider for an access token on every connect and
//! reconnect.  Providers whose tokens can expire implement
//! [`AuthProvider::expired`] and [`AuthProvider::refresh_access_token`]; the
//! handshake refreshes at most once before sending `auth`.
//!
//! ```rust,no_run
//! use hass_link::{AuthProvider, LongLivedToken};
//! use std::sync::Arc;
//!
//! // Long-lived access token created in the Home Assistant profile page
//! let auth: Arc<dyn AuthProvider> = Arc::new(LongLivedToken::new("eyJhbGc..."));
//! ```

use crate::error::{HassLinkError, Result};
use std::sync::Arc;

/// Source of the access token presented in the `auth` message.
///
/// Implementations are owned by the caller and shared with the connection's
/// background task, which calls them on every (re)connect.
#[async_trait::async_trait]
pub trait AuthProvider: Send + Sync + 'static {
    /// The current access token.
    fn access_token(&self) -> String;

    /// `true` when [`access_token`](Self::access_token) must be refreshed
    /// before it is sent.
    fn expired(&self) -> bool;

    /// Obtain a fresh access token.
    ///
    /// Any error is treated as invalid credentials by the handshake.
    async fn refresh_access_token(&self) -> Result<()>;
}

/// A reference-counted [`AuthProvider`].
pub type ArcAuthProvider = Arc<dyn AuthProvider>;

/// A long-lived access token. Never expires and cannot be refreshed.
#[derive(Clone)]
pub struct LongLivedToken {
    token: String,
}

impl LongLivedToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for LongLivedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LongLivedToken").field("token", &"<redacted>").finish()
    }
}

#[async_trait::async_trait]
impl AuthProvider for LongLivedToken {
    fn access_token(&self) -> String {
        self.token.clone()
    }

    fn expired(&self) -> bool {
        false
    }

    async fn refresh_access_token(&self) -> Result<()> {
        Err(HassLinkError::InvalidAuth(
            "Long-lived access tokens cannot be refreshed".to_string(),
        ))
    }
}
