//! Error types for hass-link.
//!
//! The first five variants mirror the numeric error codes Home Assistant
//! clients have always reported (see [`HassLinkError::code`]).

use crate::models::ErrorDetail;
use thiserror::Error;

/// Numeric code for [`HassLinkError::CannotConnect`].
pub const ERR_CANNOT_CONNECT: u8 = 1;
/// Numeric code for [`HassLinkError::InvalidAuth`].
pub const ERR_INVALID_AUTH: u8 = 2;
/// Numeric code for [`HassLinkError::ConnectionLost`].
pub const ERR_CONNECTION_LOST: u8 = 3;
/// Numeric code for [`HassLinkError::HostRequired`].
pub const ERR_HASS_HOST_REQUIRED: u8 = 4;
/// Numeric code for [`HassLinkError::InsecureDowngrade`].
pub const ERR_INVALID_HTTPS_TO_HTTP: u8 = 5;

/// Errors produced by the connection, the authenticator and the token helpers.
#[derive(Error, Debug, Clone)]
pub enum HassLinkError {
    /// Could not open an authenticated socket within the retry budget.
    #[error("Unable to connect: {0}")]
    CannotConnect(String),

    /// The server rejected the credentials, or they could not be refreshed.
    /// Never retried.
    #[error("Invalid authentication: {0}")]
    InvalidAuth(String),

    /// The socket went away while the request was outstanding.
    #[error("Connection lost")]
    ConnectionLost,

    /// No Home Assistant URL was configured.
    #[error("Home Assistant URL is required")]
    HostRequired,

    /// A plain `ws://` endpoint was requested under an `https://` base URL.
    #[error("Refusing insecure WebSocket endpoint for a secure base URL")]
    InsecureDowngrade,

    /// The server answered a command with `success: false`.
    #[error("Command failed ({}): {}", .0.code, .0.message)]
    CommandFailed(ErrorDetail),

    /// The connection was closed by the caller (or gave up reconnecting).
    #[error("Connection closed")]
    Closed,

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Timeout: {0}")]
    TimeoutError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl HassLinkError {
    /// Numeric Home Assistant client error code, when the error has one.
    pub fn code(&self) -> Option<u8> {
        match self {
            Self::CannotConnect(_) => Some(ERR_CANNOT_CONNECT),
            Self::InvalidAuth(_) => Some(ERR_INVALID_AUTH),
            Self::ConnectionLost => Some(ERR_CONNECTION_LOST),
            Self::HostRequired => Some(ERR_HASS_HOST_REQUIRED),
            Self::InsecureDowngrade => Some(ERR_INVALID_HTTPS_TO_HTTP),
            _ => None,
        }
    }

    /// `true` for failures that no amount of retrying will fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidAuth(_)
                | Self::HostRequired
                | Self::InsecureDowngrade
                | Self::ConfigurationError(_)
        )
    }
}

impl From<serde_json::Error> for HassLinkError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for HassLinkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::TimeoutError(err.to_string())
        } else {
            Self::NetworkError(err.to_string())
        }
    }
}

/// Result type for hass-link operations.
pub type Result<T> = std::result::Result<T, HassLinkError>;
