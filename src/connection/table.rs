//! Command bookkeeping for one connection.
//!
//! [`CommandTable`] owns the id counter, the pending one-shot requests and
//! the subscription registry.  It performs no I/O: every method returns the
//! text frames the caller must write to the socket, which keeps id
//! assignment and frame routing testable without a server.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};
use tokio::sync::oneshot;

use crate::error::{HassLinkError, Result};
use crate::models::{ErrorDetail, HassCommand, ServerMessage, SubscriptionInfo};

/// Callback invoked with the `event` payload of every frame routed to a
/// subscription.
pub type EventCallback = Arc<dyn Fn(JsonValue) + Send + Sync>;

pub(crate) type ReplyTx = oneshot::Sender<Result<JsonValue>>;
pub(crate) type AckTx = oneshot::Sender<Result<u64>>;

enum Pending {
    Request { reply: ReplyTx },
    /// `unsubscribe_events` for the subscription routed under `subscription`
    Unsubscribe { reply: ReplyTx, subscription: u64 },
    Subscription { key: u64 },
    /// Subscription being cancelled; late events are dropped until the
    /// server confirms
    Draining,
}

struct SubEntry {
    request: Map<String, JsonValue>,
    callback: EventCallback,
    protocol_id: Option<u64>,
    acknowledged: bool,
    ack: Option<AckTx>,
}

pub(crate) struct CommandTable {
    next_id: u64,
    next_key: u64,
    pending: HashMap<u64, Pending>,
    subscriptions: BTreeMap<u64, SubEntry>,
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandTable {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            next_key: 1,
            pending: HashMap::new(),
            subscriptions: BTreeMap::new(),
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Register a one-shot request and return the frame to send.
    ///
    /// Encoding failures are reported on `reply` and no frame is produced.
    pub(crate) fn request(&mut self, command: &HassCommand, reply: ReplyTx) -> Option<String> {
        self.track(command, reply, None)
    }

    /// Send `unsubscribe_events` for the subscription routed under `protocol_id`.
    fn request_unsubscribe(&mut self, protocol_id: u64, reply: ReplyTx) -> Option<String> {
        self.track(
            &HassCommand::UnsubscribeEvents { subscription: protocol_id },
            reply,
            Some(protocol_id),
        )
    }

    fn track(&mut self, command: &HassCommand, reply: ReplyTx, unsubscribing: Option<u64>) -> Option<String> {
        let body = match command.to_object() {
            Ok(body) => body,
            Err(e) => {
                let _ = reply.send(Err(e));
                return None;
            },
        };
        let id = self.allocate_id();
        match HassCommand::encode_with_id(&body, id) {
            Ok(text) => {
                let pending = match unsubscribing {
                    Some(subscription) => Pending::Unsubscribe { reply, subscription },
                    None => Pending::Request { reply },
                };
                self.pending.insert(id, pending);
                Some(text)
            },
            Err(e) => {
                let _ = reply.send(Err(e));
                None
            },
        }
    }

    /// Register a subscription.
    ///
    /// Returns the subscription key and, when `connected`, the subscribe
    /// frame.  A subscription registered while disconnected waits for
    /// [`reset_for_new_socket`](Self::reset_for_new_socket).
    pub(crate) fn subscribe(
        &mut self,
        command: &HassCommand,
        callback: EventCallback,
        ack: AckTx,
        connected: bool,
    ) -> Option<String> {
        let request = match command.to_object() {
            Ok(body) => body,
            Err(e) => {
                let _ = ack.send(Err(e));
                return None;
            },
        };
        let key = self.next_key;
        self.next_key += 1;

        let mut entry = SubEntry {
            request,
            callback,
            protocol_id: None,
            acknowledged: false,
            ack: Some(ack),
        };

        let frame = if connected {
            let id = self.allocate_id();
            match HassCommand::encode_with_id(&entry.request, id) {
                Ok(text) => {
                    entry.protocol_id = Some(id);
                    self.pending.insert(id, Pending::Subscription { key });
                    Some(text)
                },
                Err(e) => {
                    if let Some(ack) = entry.ack.take() {
                        let _ = ack.send(Err(e));
                    }
                    return None;
                },
            }
        } else {
            log::debug!("[hass-link] Queued subscription {} until the socket is back", key);
            None
        };

        self.subscriptions.insert(key, entry);
        frame
    }

    /// Remove subscription `key`.
    ///
    /// When the subscription is registered on the live socket, returns the
    /// `unsubscribe_events` frame and parks `reply` on it; events still in
    /// flight for its id are dropped until the server answers.  Otherwise
    /// `reply` is answered immediately.
    pub(crate) fn unsubscribe(&mut self, key: u64, reply: ReplyTx, connected: bool) -> Option<String> {
        let Some(entry) = self.subscriptions.remove(&key) else {
            let _ = reply.send(Ok(JsonValue::Null));
            return None;
        };
        if let Some(ack) = entry.ack {
            let _ = ack.send(Err(HassLinkError::Closed));
        }

        match entry.protocol_id {
            Some(protocol_id) if connected => {
                self.pending.insert(protocol_id, Pending::Draining);
                self.request_unsubscribe(protocol_id, reply)
            },
            _ => {
                let _ = reply.send(Ok(JsonValue::Null));
                None
            },
        }
    }

    /// Route one inbound frame; returns a frame to send in reply, if any.
    pub(crate) fn handle_message(&mut self, message: ServerMessage) -> Option<String> {
        match message {
            ServerMessage::Event { id, event } => {
                let callback = match self.pending.get(&id) {
                    Some(Pending::Draining) => {
                        log::debug!("[hass-link] Dropping event for cancelled subscription {}", id);
                        return None;
                    },
                    Some(Pending::Subscription { key }) => {
                        self.subscriptions.get(key).map(|entry| entry.callback.clone())
                    },
                    _ => None,
                };
                match callback {
                    Some(callback) => {
                        callback(event);
                        None
                    },
                    None => {
                        log::warn!(
                            "[hass-link] Received event for unknown subscription {}. Unsubscribing.",
                            id
                        );
                        self.pending.entry(id).or_insert(Pending::Draining);
                        let (reply, _) = oneshot::channel();
                        self.request_unsubscribe(id, reply)
                    },
                }
            },
            ServerMessage::Result {
                id,
                success,
                result,
                error,
            } => {
                match self.pending.remove(&id) {
                    Some(Pending::Request { reply }) => {
                        let outcome = if success {
                            Ok(result.unwrap_or(JsonValue::Null))
                        } else {
                            Err(HassLinkError::CommandFailed(
                                error.unwrap_or_else(ErrorDetail::unspecified),
                            ))
                        };
                        let _ = reply.send(outcome);
                    },
                    Some(Pending::Unsubscribe { reply, subscription }) => {
                        self.finish_draining(subscription);
                        let outcome = if success {
                            Ok(result.unwrap_or(JsonValue::Null))
                        } else {
                            Err(HassLinkError::CommandFailed(
                                error.unwrap_or_else(ErrorDetail::unspecified),
                            ))
                        };
                        let _ = reply.send(outcome);
                    },
                    Some(Pending::Draining) => {
                        // Late subscribe ack; the route goes when the unsubscribe lands.
                        self.pending.insert(id, Pending::Draining);
                    },
                    Some(Pending::Subscription { key }) => {
                        if success {
                            // Events keep arriving under this id.
                            self.pending.insert(id, Pending::Subscription { key });
                            if let Some(entry) = self.subscriptions.get_mut(&key) {
                                entry.acknowledged = true;
                                if let Some(ack) = entry.ack.take() {
                                    let _ = ack.send(Ok(key));
                                }
                            }
                        } else {
                            let detail = error.unwrap_or_else(ErrorDetail::unspecified);
                            if let Some(entry) = self.subscriptions.remove(&key) {
                                match entry.ack {
                                    Some(ack) => {
                                        let _ = ack.send(Err(HassLinkError::CommandFailed(detail)));
                                    },
                                    None => log::warn!(
                                        "[hass-link] Server rejected subscription {}: {}",
                                        key,
                                        detail.message
                                    ),
                                }
                            }
                        }
                    },
                    None => {
                        log::debug!("[hass-link] Result for unknown command id {}", id);
                    },
                }
                None
            },
            ServerMessage::Pong { id } => {
                match self.pending.remove(&id) {
                    Some(Pending::Request { reply }) => {
                        let _ = reply.send(Ok(JsonValue::Null));
                    },
                    Some(other) => {
                        self.pending.insert(id, other);
                    },
                    None => log::debug!("[hass-link] Pong for unknown command id {}", id),
                }
                None
            },
            ServerMessage::AuthRequired { .. }
            | ServerMessage::AuthOk { .. }
            | ServerMessage::AuthInvalid { .. } => {
                log::debug!("[hass-link] Ignoring auth-phase frame on an authenticated socket");
                None
            },
        }
    }

    /// Settle the command a frame that failed to decode was addressed to.
    ///
    /// One-shot requests are rejected with `error`, as is a subscription
    /// still waiting for its acknowledgement when the frame was a `result`.
    /// Returns `false` when nothing was settled.
    pub(crate) fn reject_undecodable(&mut self, id: u64, kind: Option<&str>, error: HassLinkError) -> bool {
        match self.pending.remove(&id) {
            Some(Pending::Request { reply }) => {
                let _ = reply.send(Err(error));
                true
            },
            Some(Pending::Unsubscribe { reply, subscription }) => {
                self.finish_draining(subscription);
                let _ = reply.send(Err(error));
                true
            },
            Some(Pending::Subscription { key }) => {
                let awaiting_ack = self
                    .subscriptions
                    .get(&key)
                    .map_or(false, |entry| entry.ack.is_some());
                if kind == Some("result") && awaiting_ack {
                    if let Some(SubEntry { ack: Some(ack), .. }) = self.subscriptions.remove(&key) {
                        let _ = ack.send(Err(error));
                    }
                    true
                } else {
                    self.pending.insert(id, Pending::Subscription { key });
                    false
                }
            },
            Some(other) => {
                self.pending.insert(id, other);
                false
            },
            None => false,
        }
    }

    fn finish_draining(&mut self, subscription: u64) {
        if matches!(self.pending.get(&subscription), Some(Pending::Draining)) {
            self.pending.remove(&subscription);
        }
    }

    /// Reject every outstanding one-shot request with `ConnectionLost`.
    ///
    /// Subscriptions stay registered; their protocol ids become stale.
    pub(crate) fn reject_requests(&mut self) {
        let mut rejected = 0usize;
        for (_, pending) in self.pending.drain() {
            match pending {
                Pending::Request { reply } | Pending::Unsubscribe { reply, .. } => {
                    let _ = reply.send(Err(HassLinkError::ConnectionLost));
                    rejected += 1;
                },
                Pending::Subscription { .. } | Pending::Draining => {},
            }
        }
        for entry in self.subscriptions.values_mut() {
            entry.protocol_id = None;
            entry.acknowledged = false;
        }
        if rejected > 0 {
            log::debug!("[hass-link] Rejected {} pending request(s)", rejected);
        }
    }

    /// Prepare for a fresh socket: ids restart at 1 and every subscription
    /// is re-issued in registration order under a new id.
    pub(crate) fn reset_for_new_socket(&mut self) -> Vec<String> {
        self.reject_requests();
        self.next_id = 1;

        let mut frames = Vec::with_capacity(self.subscriptions.len());
        let keys: Vec<u64> = self.subscriptions.keys().copied().collect();
        for key in keys {
            let id = self.allocate_id();
            let Some(entry) = self.subscriptions.get_mut(&key) else {
                continue;
            };
            match HassCommand::encode_with_id(&entry.request, id) {
                Ok(text) => {
                    entry.protocol_id = Some(id);
                    self.pending.insert(id, Pending::Subscription { key });
                    frames.push(text);
                },
                Err(e) => log::warn!("[hass-link] Failed to re-encode subscription {}: {}", key, e),
            }
        }
        if !frames.is_empty() {
            log::info!("[hass-link] Re-subscribing {} subscription(s)", frames.len());
        }
        frames
    }

    /// Drop every subscription, failing acknowledgements still awaited.
    pub(crate) fn fail_subscriptions(&mut self, error: &HassLinkError) {
        for (_, entry) in std::mem::take(&mut self.subscriptions) {
            if let Some(ack) = entry.ack {
                let _ = ack.send(Err(error.clone()));
            }
        }
        self.pending.clear();
    }

    pub(crate) fn list(&self) -> Vec<SubscriptionInfo> {
        self.subscriptions
            .iter()
            .map(|(key, entry)| SubscriptionInfo {
                key: *key,
                protocol_id: entry.protocol_id,
                request: entry.request.clone(),
                acknowledged: entry.acknowledged,
            })
            .collect()
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
