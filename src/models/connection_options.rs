use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection-level options for the Home Assistant WebSocket client.
///
/// These options control:
/// - Where to connect (base URL and optional WebSocket URL override)
/// - How hard the initial handshake retries (`setup_retry`)
/// - Automatic reconnection after the socket is lost, and its backoff
///
/// Timeouts live separately in [`HassLinkTimeouts`](crate::HassLinkTimeouts).
///
/// # Example
///
/// ```rust
/// use hass_link::ConnectionOptions;
///
/// let options = ConnectionOptions::new("http://homeassistant.local:8123")
///     .with_setup_retry(-1)
///     .with_reconnect_delay_step_ms(500)
///     .with_max_reconnect_attempts(Some(20));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionOptions {
    /// Home Assistant base URL (`http(s)://host:port`) or a `ws(s)://` URL.
    #[serde(default)]
    pub url: String,

    /// Explicit WebSocket endpoint, used instead of `<url>/api/websocket`.
    #[serde(default)]
    pub ws_url: Option<String>,

    /// Retry budget for the initial handshake.
    /// `0` = single attempt, `-1` = retry forever, `n` = up to `n` retries.
    /// Default: 0
    #[serde(default)]
    pub setup_retry: i32,

    /// Delay between initial handshake retries.
    /// Default: 1000ms
    #[serde(default = "default_setup_retry_delay_ms")]
    pub setup_retry_delay_ms: u64,

    /// Reconnect automatically after an abnormal disconnect.
    /// Default: true
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,

    /// Backoff step: attempt `n` waits `n * step` (capped) before dialing.
    /// Default: 1000ms
    #[serde(default = "default_reconnect_delay_step_ms")]
    pub reconnect_delay_step_ms: u64,

    /// Upper bound for the reconnect backoff.
    /// Default: 5000ms
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,

    /// Give up after this many failed reconnect attempts.
    /// Default: None (retry until the credentials are rejected)
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,
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

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            url: String::new(),
            ws_url: None,
            setup_retry: 0,
            setup_retry_delay_ms: default_setup_retry_delay_ms(),
            auto_reconnect: true,
            reconnect_delay_step_ms: default_reconnect_delay_step_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            max_reconnect_attempts: None,
        }
    }
}

impl ConnectionOptions {
    /// Create options for the given base URL with defaults for everything else
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Override the WebSocket endpoint
    pub fn with_ws_url(mut self, ws_url: impl Into<String>) -> Self {
        self.ws_url = Some(ws_url.into());
        self
    }

    /// Set the initial handshake retry budget (`-1` = forever)
    pub fn with_setup_retry(mut self, retries: i32) -> Self {
        self.setup_retry = retries;
        self
    }

    /// Set the delay between initial handshake retries (in milliseconds)
    pub fn with_setup_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.setup_retry_delay_ms = delay_ms;
        self
    }

    /// Set whether to reconnect automatically on connection loss
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the reconnect backoff step (in milliseconds)
    pub fn with_reconnect_delay_step_ms(mut self, step_ms: u64) -> Self {
        self.reconnect_delay_step_ms = step_ms;
        self
    }

    /// Set the reconnect backoff cap (in milliseconds)
    pub fn with_max_reconnect_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_reconnect_delay_ms = max_delay_ms;
        self
    }

    /// Set the maximum number of reconnect attempts (None = unlimited)
    pub fn with_max_reconnect_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self
    }

    /// Delay before reconnect attempt `attempt` (0-based): `min(attempt * step, cap)`.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let delay = self
            .reconnect_delay_step_ms
            .saturating_mul(u64::from(attempt))
            .min(self.max_reconnect_delay_ms);
        Duration::from_millis(delay)
    }

    /// Delay between initial handshake retries.
    pub fn setup_retry_delay(&self) -> Duration {
        Duration::from_millis(self.setup_retry_delay_ms)
    }
}
