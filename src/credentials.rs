//! Token storage for refreshable Home Assistant credentials.
//!
//! A [`TokenStore`] is owned by the caller and handed to
//! [`Auth`](crate::auth::Auth); every successful refresh is written back
//! through it.  There is no process-wide token cache.

use crate::error::{HassLinkError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// OAuth-style token set issued by Home Assistant's `/auth/token` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthData {
    /// Base URL of the Home Assistant instance that issued the tokens
    pub hass_url: String,

    /// OAuth client id used during login (`None` for the default client)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Expiry of `access_token`, in milliseconds since the Unix epoch
    pub expires: u64,

    /// Token used to mint new access tokens
    pub refresh_token: String,

    /// Bearer token presented in the `auth` message
    pub access_token: String,

    /// Lifetime of `access_token` in seconds, as reported by the server
    pub expires_in: u64,
}

/// Trait for token storage backends.
///
/// Implementations must be shareable across tasks: [`Auth`](crate::auth::Auth)
/// calls `save_tokens` from whichever task performs the refresh.
pub trait TokenStore: Send + Sync {
    /// Load the stored token set, `Ok(None)` if nothing is stored.
    fn load_tokens(&self) -> Result<Option<AuthData>>;

    /// Store a token set, replacing any previous one.
    fn save_tokens(&self, tokens: &AuthData) -> Result<()>;

    /// Remove the stored token set. Succeeds if nothing was stored.
    fn clear_tokens(&self) -> Result<()>;
}

/// A shared, reference-counted [`TokenStore`].
pub type ArcTokenStore = Arc<dyn TokenStore>;

/// In-memory token store for tests and short-lived sessions.
///
/// # Example
///
/// ```rust
/// use hass_link::credentials::{MemoryTokenStore, TokenStore};
///
/// let store = MemoryTokenStore::new();
/// assert!(store.load_tokens().unwrap().is_none());
/// ```
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<Option<AuthData>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn load_tokens(&self) -> Result<Option<AuthData>> {
        let guard = self
            .tokens
            .lock()
            .map_err(|_| HassLinkError::InternalError("Token store lock poisoned".to_string()))?;
        Ok(guard.clone())
    }

    fn save_tokens(&self, tokens: &AuthData) -> Result<()> {
        let mut guard = self
            .tokens
            .lock()
            .map_err(|_| HassLinkError::InternalError("Token store lock poisoned".to_string()))?;
        *guard = Some(tokens.clone());
        Ok(())
    }

    fn clear_tokens(&self) -> Result<()> {
        let mut guard = self
            .tokens
            .lock()
            .map_err(|_| HassLinkError::InternalError("Token store lock poisoned".to_string()))?;
        *guard = None;
        Ok(())
    }
}

/// File-backed token store.
///
/// Writes the token set as TOML with 0600 permissions on Unix.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    file_path: PathBuf,
}

impl FileTokenStore {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
        }
    }

    /// Get the file path used by this store
    pub fn path(&self) -> &Path {
        &self.file_path
    }
}

impl TokenStore for FileTokenStore {
    fn load_tokens(&self) -> Result<Option<AuthData>> {
        if !self.file_path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&self.file_path).map_err(|e| {
            HassLinkError::ConfigurationError(format!(
                "Failed to read token file '{}': {}",
                self.file_path.display(),
                e
            ))
        })?;

        let tokens = toml::from_str(&contents).map_err(|e| {
            HassLinkError::ConfigurationError(format!(
                "Failed to parse token file '{}': {}",
                self.file_path.display(),
                e
            ))
        })?;
        Ok(Some(tokens))
    }

    fn save_tokens(&self, tokens: &AuthData) -> Result<()> {
        let contents = toml::to_string_pretty(tokens).map_err(|e| {
            HassLinkError::SerializationError(format!("Failed to serialize tokens: {}", e))
        })?;

        if let Some(parent) = self.file_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                HassLinkError::ConfigurationError(format!(
                    "Failed to create token directory '{}': {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        fs::write(&self.file_path, contents).map_err(|e| {
            HassLinkError::ConfigurationError(format!(
                "Failed to write token file '{}': {}",
                self.file_path.display(),
                e
            ))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&self.file_path, permissions).map_err(|e| {
                HassLinkError::ConfigurationError(format!(
                    "Failed to set permissions on '{}': {}",
                    self.file_path.display(),
                    e
                ))
            })?;
        }

        Ok(())
    }

    fn clear_tokens(&self) -> Result<()> {
        match fs::remove_file(&self.file_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HassLinkError::ConfigurationError(format!(
                "Failed to remove token file '{}': {}",
                self.file_path.display(),
                e
            ))),
        }
    }
}
