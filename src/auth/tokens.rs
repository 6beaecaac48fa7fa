//! Refreshable OAuth tokens issued by Home Assistant's `/auth/token` endpoint.

use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;

use super::provider::AuthProvider;
use crate::credentials::{AuthData, TokenStore};
use crate::error::{HassLinkError, Result};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// OAuth-style credentials with refresh support.
///
/// Every successful refresh updates the in-memory token set and, when a
/// [`TokenStore`] is attached, writes it back through the store.
///
/// ```rust,no_run
/// use hass_link::auth::Auth;
/// use hass_link::credentials::FileTokenStore;
/// use std::sync::Arc;
///
/// # fn main() -> hass_link::Result<()> {
/// let store = Arc::new(FileTokenStore::new("/home/me/.config/hass-link/tokens.toml"));
/// if let Some(auth) = Auth::load(store)? {
///     println!("Tokens for {}", auth.hass_url());
/// }
/// # Ok(())
/// # }
/// ```
pub struct Auth {
    data: RwLock<AuthData>,
    store: Option<Arc<dyn TokenStore>>,
    http: reqwest::Client,
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("hass_url", &self.hass_url())
            .field("has_store", &self.store.is_some())
            .finish()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Auth {
    pub fn new(data: AuthData) -> Self {
        Self {
            data: RwLock::new(data),
            store: None,
            http: reqwest::Client::new(),
        }
    }

    /// Attach a store that receives every refreshed token set.
    pub fn with_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a preconfigured HTTP client for token requests.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Restore credentials from `store`; `Ok(None)` when it is empty.
    pub fn load(store: Arc<dyn TokenStore>) -> Result<Option<Self>> {
        Ok(store
            .load_tokens()?
            .map(|data| Self::new(data).with_store(store)))
    }

    /// Snapshot of the current token set.
    pub fn data(&self) -> AuthData {
        self.read().clone()
    }

    pub fn hass_url(&self) -> String {
        self.read().hass_url.clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, AuthData> {
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn token_url(hass_url: &str) -> String {
        format!("{}/auth/token", hass_url.trim_end_matches('/'))
    }

    /// Revoke the refresh token on the server and clear the attached store.
    ///
    /// The access token stays usable until it expires.
    pub async fn revoke(&self) -> Result<()> {
        let data = self.data();
        let form = [("action", "revoke"), ("token", data.refresh_token.as_str())];
        self.http
            .post(Self::token_url(&data.hass_url))
            .form(&form)
            .send()
            .await?;

        if let Some(store) = &self.store {
            store.clear_tokens()?;
        }
        log::info!("[hass-link] Revoked refresh token for {}", data.hass_url);
        Ok(())
    }
}

#[async_trait::async_trait]
impl AuthProvider for Auth {
    fn access_token(&self) -> String {
        self.read().access_token.clone()
    }

    fn expired(&self) -> bool {
        now_millis() > self.read().expires
    }

    async fn refresh_access_token(&self) -> Result<()> {
        let data = self.data();
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", data.refresh_token.as_str()),
        ];
        if let Some(client_id) = data.client_id.as_deref() {
            form.push(("client_id", client_id));
        }

        log::debug!("[hass-link] Refreshing access token for {}", data.hass_url);
        let response = self
            .http
            .post(Self::token_url(&data.hass_url))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 400 || status.as_u16() == 403 {
            return Err(HassLinkError::InvalidAuth(format!(
                "Refresh token rejected (HTTP {})",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(HassLinkError::NetworkError(format!(
                "Unable to fetch tokens (HTTP {})",
                status.as_u16()
            )));
        }

        let body: TokenResponse = response.json().await?;
        let updated = {
            let mut guard = self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.access_token = body.access_token;
            guard.expires_in = body.expires_in;
            guard.expires = now_millis().saturating_add(body.expires_in.saturating_mul(1000));
            guard.clone()
        };

        if let Some(store) = &self.store {
            store.save_tokens(&updated)?;
        }
        log::info!(
            "[hass-link] Access token refreshed, valid for {}s",
            updated.expires_in
        );
        Ok(())
    }
}
