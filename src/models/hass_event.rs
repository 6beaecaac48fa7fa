use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Context attached to every event fired on the Home Assistant event bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EventContext {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
}

/// A bus event as delivered by a `subscribe_events` subscription.
///
/// Subscription callbacks receive the raw `event` payload; use
/// [`HassEvent::from_value`] when the subscription is known to carry bus
/// events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HassEvent {
    pub event_type: String,
    #[serde(default)]
    pub data: JsonValue,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub time_fired: Option<String>,
    #[serde(default)]
    pub context: Option<EventContext>,
}

impl HassEvent {
    pub fn from_value(value: &JsonValue) -> crate::Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}
