use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use crate::error::{HassLinkError, Result};

/// Commands sent once the socket is authenticated.
///
/// Every command goes out as `{"type": ..., "id": N, ...fields}`; the id is
/// assigned by the connection, never by the caller.  Commands the crate does
/// not model can be sent through [`HassCommand::custom`].
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HassCommand {
    /// Liveness probe, answered with a `pong` frame
    Ping,

    /// Fetch all entity states
    GetStates,

    /// Fetch the core configuration
    GetConfig,

    /// Fetch the service registry
    GetServices,

    /// Fetch registered frontend panels
    GetPanels,

    /// Fetch the authenticated user
    #[serde(rename = "auth/current_user")]
    CurrentUser,

    /// Invoke a service
    CallService {
        domain: String,
        service: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        service_data: Option<JsonValue>,
    },

    /// Subscribe to the event bus, optionally filtered by event type
    SubscribeEvents {
        #[serde(skip_serializing_if = "Option::is_none")]
        event_type: Option<String>,
    },

    /// Cancel a subscription by the id its subscribe command was sent under
    UnsubscribeEvents { subscription: u64 },

    /// Any other command; the object must carry a string `type` field
    #[serde(untagged)]
    Custom(Map<String, JsonValue>),
}

impl HassCommand {
    /// Build a `call_service` command.
    pub fn call_service(
        domain: impl Into<String>,
        service: impl Into<String>,
        service_data: Option<JsonValue>,
    ) -> Self {
        Self::CallService {
            domain: domain.into(),
            service: service.into(),
            service_data,
        }
    }

    /// Build a `subscribe_events` command.
    pub fn subscribe_events(event_type: Option<&str>) -> Self {
        Self::SubscribeEvents {
            event_type: event_type.map(str::to_string),
        }
    }

    /// Wrap an arbitrary JSON object as a command.
    ///
    /// Fails unless `value` is an object with a string `type` and no `id`.
    pub fn custom(value: JsonValue) -> Result<Self> {
        match value {
            JsonValue::Object(map) => {
                if !map.get("type").map_or(false, JsonValue::is_string) {
                    return Err(HassLinkError::ConfigurationError(
                        "Custom command must carry a string 'type' field".to_string(),
                    ));
                }
                if map.contains_key("id") {
                    return Err(HassLinkError::ConfigurationError(
                        "Custom command must not set 'id'; ids are assigned by the connection"
                            .to_string(),
                    ));
                }
                Ok(Self::Custom(map))
            },
            other => Err(HassLinkError::ConfigurationError(format!(
                "Custom command must be a JSON object, got {}",
                other
            ))),
        }
    }

    /// The wire `type` of this command.
    pub fn kind(&self) -> &str {
        match self {
            Self::Ping => "ping",
            Self::GetStates => "get_states",
            Self::GetConfig => "get_config",
            Self::GetServices => "get_services",
            Self::GetPanels => "get_panels",
            Self::CurrentUser => "auth/current_user",
            Self::CallService { .. } => "call_service",
            Self::SubscribeEvents { .. } => "subscribe_events",
            Self::UnsubscribeEvents { .. } => "unsubscribe_events",
            Self::Custom(map) => map.get("type").and_then(JsonValue::as_str).unwrap_or(""),
        }
    }

    /// Serialize the command body without an id.
    pub(crate) fn to_object(&self) -> Result<Map<String, JsonValue>> {
        match serde_json::to_value(self)? {
            JsonValue::Object(map) => Ok(map),
            other => Err(HassLinkError::SerializationError(format!(
                "Command did not serialize to an object: {}",
                other
            ))),
        }
    }

    /// Serialize `{...body, id}` into the text payload sent on the socket.
    pub(crate) fn encode_with_id(body: &Map<String, JsonValue>, id: u64) -> Result<String> {
        let mut map = body.clone();
        map.insert("id".to_string(), JsonValue::from(id));
        Ok(serde_json::to_string(&map)?)
    }
}
