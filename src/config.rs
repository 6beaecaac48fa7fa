//! Configuration file management
//!
//! `LinkConfiguration` with TOML parsing for `~/.config/hass-link/config.toml`.
//!
//! # Configuration Format
//!
//! ```toml
//! [server]
//! url = "http://homeassistant.local:8123"   # Home Assistant base URL
//! # ws_url = "wss://proxy.example/api/websocket"
//!
//! [auth]
//! access_token = "long-lived-token"         # Long-lived access token
//! # token_file = "~/.config/hass-link/tokens.toml"  # Refreshable OAuth tokens
//!
//! [connection]
//! setup_retry = 3                # Initial handshake retries (-1 = forever)
//! setup_retry_delay_ms = 1000
//! auto_reconnect = true          # Reconnect on connection loss
//! reconnect_delay_step_ms = 1000 # Backoff grows by this much per attempt
//! max_reconnect_delay_ms = 5000  # ...up to this cap
//! max_reconnect_attempts = 0     # 0 = unlimited
//!
//! [timeouts]
//! connection_timeout_secs = 10
//! auth_timeout_secs = 10
//! keepalive_interval_secs = 0    # 0 = no keepalive
//! pong_timeout_secs = 10
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{HassLinkError, Result};
use crate::models::ConnectionOptions;
use crate::timeouts::HassLinkTimeouts;

/// Configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LinkConfiguration {
    /// Server location
    pub server: Option<ServerConfig>,

    /// Credentials
    pub auth: Option<AuthConfig>,

    /// Handshake retry and reconnection settings
    pub connection: Option<ConnectionConfig>,

    /// Transport, handshake and keepalive timeouts
    pub timeouts: Option<TimeoutsConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Home Assistant base URL (e.g. http://homeassistant.local:8123)
    pub url: Option<String>,

    /// Explicit WebSocket endpoint
    pub ws_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AuthConfig {
    /// Long-lived access token
    pub access_token: Option<String>,

    /// File holding refreshable tokens, see [`FileTokenStore`](crate::credentials::FileTokenStore)
    pub token_file: Option<String>,
}

/// Connection settings for retry and reconnection behavior
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    /// Initial handshake retry budget (default: 0, -1 = forever)
    #[serde(default)]
    pub setup_retry: i32,

    /// Delay between handshake retries in milliseconds (default: 1000)
    #[serde(default = "default_setup_retry_delay_ms")]
    pub setup_retry_delay_ms: u64,

    /// Enable automatic reconnection on connection loss (default: true)
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,

    /// Reconnect backoff step in milliseconds (default: 1000)
    #[serde(default = "default_reconnect_delay_step_ms")]
    pub reconnect_delay_step_ms: u64,

    /// Reconnect backoff cap in milliseconds (default: 5000)
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,

    /// Maximum number of reconnection attempts (0 = unlimited, default: 0)
    #[serde(default)]
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutsConfig {
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,

    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,

    /// Idle seconds before a keepalive ping (0 = disabled)
    #[serde(default)]
    pub keepalive_interval_secs: u64,

    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
}

fn default_setup_retry_delay_ms() -> u64 {
    1000
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_reconnect_delay_step_ms() -> u64 {
    1000
}

fn default_max_reconnect_delay_ms() -> u64 {
    5000
}

fn default_connection_timeout_secs() -> u64 {
    10
}

fn default_auth_timeout_secs() -> u64 {
    10
}

fn default_pong_timeout_secs() -> u64 {
    10
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            setup_retry: 0,
            setup_retry_delay_ms: default_setup_retry_delay_ms(),
            auto_reconnect: default_auto_reconnect(),
            reconnect_delay_step_ms: default_reconnect_delay_step_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            max_reconnect_attempts: 0,
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connection_timeout_secs: default_connection_timeout_secs(),
            auth_timeout_secs: default_auth_timeout_secs(),
            keepalive_interval_secs: 0,
            pong_timeout_secs: default_pong_timeout_secs(),
        }
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_config_path(path: &Path) -> PathBuf {
    if let Some(rest) = path.to_str().and_then(|s| s.strip_prefix("~/")) {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(rest);
        }
    }
    path.to_path_buf()
}

pub fn default_config_path() -> PathBuf {
    expand_config_path(Path::new("~/.config/hass-link/config.toml"))
}

impl LinkConfiguration {
    /// Load configuration from file
    ///
    /// Returns the default configuration if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        let path = expand_config_path(path);
        if !path.exists() {
            log::debug!("[hass-link] No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&path).map_err(|e| {
            HassLinkError::ConfigurationError(format!("Failed to read config file: {}", e))
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| {
            HassLinkError::ConfigurationError(format!("Failed to parse config file: {}", e))
        })
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let path = expand_config_path(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                HassLinkError::ConfigurationError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let contents = toml::to_string_pretty(self).map_err(|e| {
            HassLinkError::ConfigurationError(format!("Failed to serialize: {}", e))
        })?;
        std::fs::write(&path, contents).map_err(|e| {
            HassLinkError::ConfigurationError(format!("Failed to write config file: {}", e))
        })
    }

    /// Build [`ConnectionOptions`] from the `[server]` and `[connection]` tables.
    pub fn to_connection_options(&self) -> ConnectionOptions {
        let server = self.server.clone().unwrap_or_default();
        let conn = self.resolved_connection();

        let mut options = ConnectionOptions::new(server.url.unwrap_or_default())
            .with_setup_retry(conn.setup_retry)
            .with_setup_retry_delay_ms(conn.setup_retry_delay_ms)
            .with_auto_reconnect(conn.auto_reconnect)
            .with_reconnect_delay_step_ms(conn.reconnect_delay_step_ms)
            .with_max_reconnect_delay_ms(conn.max_reconnect_delay_ms);

        // Convert 0 to None (unlimited), otherwise Some(n)
        let max_attempts = if conn.max_reconnect_attempts == 0 {
            None
        } else {
            Some(conn.max_reconnect_attempts)
        };
        options = options.with_max_reconnect_attempts(max_attempts);

        if let Some(ws_url) = server.ws_url {
            options = options.with_ws_url(ws_url);
        }
        options
    }

    pub fn to_timeouts(&self) -> HassLinkTimeouts {
        let t = self.timeouts.clone().unwrap_or_default();
        HassLinkTimeouts::builder()
            .connection_timeout_secs(t.connection_timeout_secs)
            .auth_timeout_secs(t.auth_timeout_secs)
            .keepalive_interval_secs(t.keepalive_interval_secs)
            .pong_timeout_secs(t.pong_timeout_secs)
            .build()
    }

    pub fn resolved_connection(&self) -> ConnectionConfig {
        self.connection.clone().unwrap_or_default()
    }

    pub fn access_token(&self) -> Option<&str> {
        self.auth.as_ref().and_then(|a| a.access_token.as_deref())
    }

    /// Expanded path of the refreshable token file, if configured.
    pub fn token_file(&self) -> Option<PathBuf> {
        self.auth
            .as_ref()
            .and_then(|a| a.token_file.as_deref())
            .map(|p| expand_config_path(Path::new(p)))
    }
}
