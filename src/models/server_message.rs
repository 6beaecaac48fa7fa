use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::error_detail::ErrorDetail;

/// Frames sent from the server to the client.
///
/// The set is closed: a frame whose `type` is not listed here fails to parse
/// and is logged by the connection instead of being silently dispatched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame on a fresh socket; the client must authenticate
    AuthRequired {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ha_version: Option<String>,
    },

    /// Credentials accepted; the socket is ready for commands
    AuthOk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ha_version: Option<String>,
    },

    /// Credentials rejected; the server closes the socket afterwards
    AuthInvalid {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Outcome of the command sent under `id`
    Result {
        id: u64,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<JsonValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorDetail>,
    },

    /// Event pushed for the subscription registered under `id`
    Event { id: u64, event: JsonValue },

    /// Answer to a `ping` command
    Pong { id: u64 },
}

impl ServerMessage {
    /// Command id the frame refers to, if any.
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::Result { id, .. } | Self::Event { id, .. } | Self::Pong { id } => Some(*id),
            Self::AuthRequired { .. } | Self::AuthOk { .. } | Self::AuthInvalid { .. } => None,
        }
    }
}
