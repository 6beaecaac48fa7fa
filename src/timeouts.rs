//! Timeout configuration for hass-link operations.
//!
//! Covers the transport dial, the authentication handshake, and the optional
//! keepalive used to detect dead sockets.  Command round-trips are never
//! timed out: a request resolves on its `result` frame or on connection loss.

use std::time::Duration;

/// Timeout configuration for the Home Assistant connection.
///
/// # Examples
///
/// ```rust
/// use hass_link::HassLinkTimeouts;
/// use std::time::Duration;
///
/// // Defaults: no keepalive, 10s dial, 10s auth
/// let timeouts = HassLinkTimeouts::default();
///
/// // Detect half-open sockets behind NAT boxes
/// let timeouts = HassLinkTimeouts::builder()
///     .keepalive_interval(Duration::from_secs(30))
///     .pong_timeout(Duration::from_secs(10))
///     .build();
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HassLinkTimeouts {
    /// Timeout for establishing the transport (TCP + TLS + WebSocket upgrade).
    /// Default: 10 seconds
    pub connection_timeout: Duration,

    /// Timeout for the auth exchange, from sending `auth` to `auth_ok`.
    /// Default: 10 seconds
    pub auth_timeout: Duration,

    /// Idle time after which the connection sends a `ping` command.
    /// Set to 0 to disable keepalive.
    /// Default: 0 (disabled)
    pub keepalive_interval: Duration,

    /// Maximum time to wait for any frame after a keepalive `ping`.
    /// If nothing arrives the socket is treated as dead and reconnected.
    /// Set to 0 to disable pong checking.
    /// Default: 10 seconds
    pub pong_timeout: Duration,
}

impl Default for HassLinkTimeouts {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::ZERO,
            pong_timeout: Duration::from_secs(10),
        }
    }
}

impl HassLinkTimeouts {
    /// Create a new builder for custom timeout configuration.
    pub fn builder() -> HassLinkTimeoutsBuilder {
        HassLinkTimeoutsBuilder::new()
    }

    /// Short timeouts for a Home Assistant instance on the local network.
    pub fn fast() -> Self {
        Self {
            connection_timeout: Duration::from_secs(2),
            auth_timeout: Duration::from_secs(2),
            keepalive_interval: Duration::from_secs(15),
            pong_timeout: Duration::from_secs(5),
        }
    }

    /// Long timeouts for remote access over slow or lossy links.
    pub fn relaxed() -> Self {
        Self {
            connection_timeout: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(60),
            pong_timeout: Duration::from_secs(30),
        }
    }

    /// Check if a duration represents "no timeout" (zero or very large).
    pub fn is_no_timeout(duration: Duration) -> bool {
        duration.is_zero() || duration > Duration::from_secs(86400 * 365)
    }

    /// Whether idle keepalive pings are enabled.
    pub fn has_keepalive(&self) -> bool {
        !self.keepalive_interval.is_zero()
    }
}

/// Builder for creating custom [`HassLinkTimeouts`] configurations.
#[derive(Debug, Clone)]
pub struct HassLinkTimeoutsBuilder {
    timeouts: HassLinkTimeouts,
}

impl HassLinkTimeoutsBuilder {
    fn new() -> Self {
        Self {
            timeouts: HassLinkTimeouts::default(),
        }
    }

    /// Set the connection timeout (TCP + TLS + upgrade).
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connection_timeout = timeout;
        self
    }

    /// Set the connection timeout in seconds.
    pub fn connection_timeout_secs(self, secs: u64) -> Self {
        self.connection_timeout(Duration::from_secs(secs))
    }

    /// Set the authentication handshake timeout.
    pub fn auth_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.auth_timeout = timeout;
        self
    }

    /// Set the authentication handshake timeout in seconds.
    pub fn auth_timeout_secs(self, secs: u64) -> Self {
        self.auth_timeout(Duration::from_secs(secs))
    }

    /// Set the keepalive interval. 0 disables keepalive.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.timeouts.keepalive_interval = interval;
        self
    }

    /// Set the keepalive interval in seconds. 0 disables keepalive.
    pub fn keepalive_interval_secs(self, secs: u64) -> Self {
        self.keepalive_interval(Duration::from_secs(secs))
    }

    /// Set the pong timeout. 0 disables pong checking.
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.pong_timeout = timeout;
        self
    }

    /// Set the pong timeout in seconds. 0 disables pong checking.
    pub fn pong_timeout_secs(self, secs: u64) -> Self {
        self.pong_timeout(Duration::from_secs(secs))
    }

    /// Build the timeout configuration.
    pub fn build(self) -> HassLinkTimeouts {
        self.timeouts
    }
}
