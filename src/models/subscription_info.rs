use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Snapshot of one active subscription, as returned by
/// [`Connection::list_subscriptions`](crate::Connection::list_subscriptions).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionInfo {
    /// Stable handle id; survives reconnects
    pub key: u64,

    /// Command id the subscription is registered under on the current
    /// socket, `None` while it waits for a socket
    pub protocol_id: Option<u64>,

    /// The subscribe command as it is replayed after a reconnect
    pub request: Map<String, JsonValue>,

    /// Whether the server has acknowledged the subscription on this socket
    pub acknowledged: bool,
}
