//! Background connection task.
//!
//! Owns the socket and the [`CommandTable`].  The public
//! [`Connection`](super::Connection) handle talks to it over an mpsc channel;
//! every table mutation happens here, so frames are processed strictly in
//! delivery order and send/receive never race.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant as TokioInstant;
use tokio_tungstenite::tungstenite::protocol::Message;

use super::table::{AckTx, CommandTable, EventCallback, ReplyTx};
use super::{ConnectionState, SharedState};
use crate::{
    auth::ArcAuthProvider,
    error::HassLinkError,
    event_handlers::{DisconnectReason, EventHandlers},
    models::{ConnectionOptions, HassCommand, ServerMessage, SubscriptionInfo},
    socket::{create_authenticated_socket, WebSocketStream},
    timeouts::HassLinkTimeouts,
};

/// Maximum text frame accepted from the server (64 MiB).
const MAX_WS_TEXT_MESSAGE_BYTES: usize = 64 << 20;

/// A duration far enough in the future (~100 years) to act as "never" for
/// deadline calculations without overflowing `Instant::now() + dur`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Commands sent from the public API to the background connection task.
pub(crate) enum ConnCmd {
    Send {
        command: HassCommand,
        reply: ReplyTx,
    },
    Subscribe {
        command: HassCommand,
        callback: EventCallback,
        ack: AckTx,
    },
    Unsubscribe {
        key: u64,
        reply: ReplyTx,
    },
    ListSubscriptions {
        reply: oneshot::Sender<Vec<SubscriptionInfo>>,
    },
    Close {
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Why [`ConnectionTask::serve_socket`] stopped serving a socket.
enum SocketOutcome {
    CloseRequested(Option<oneshot::Sender<()>>),
    Lost(DisconnectReason),
}

/// What to do with a command received while no socket is available.
enum Offline {
    Continue,
    Close(Option<oneshot::Sender<()>>),
}

pub(crate) struct ConnectionTask {
    pub(crate) cmd_rx: mpsc::Receiver<ConnCmd>,
    pub(crate) options: ConnectionOptions,
    pub(crate) timeouts: HassLinkTimeouts,
    pub(crate) auth: ArcAuthProvider,
    pub(crate) event_handlers: EventHandlers,
    pub(crate) shared: Arc<SharedState>,
    pub(crate) table: CommandTable,
}

impl ConnectionTask {
    /// Serve `ws` and every replacement socket until the connection closes.
    pub(crate) async fn run(mut self, mut ws: WebSocketStream) {
        loop {
            match self.serve_socket(&mut ws).await {
                SocketOutcome::CloseRequested(reply) => {
                    log::info!("[hass-link] Closing connection");
                    let _ = ws.close(None).await;
                    self.shutdown(reply);
                    return;
                },
                SocketOutcome::Lost(reason) => {
                    log::warn!("[hass-link] Connection lost: {}", reason);
                    self.table.reject_requests();
                    self.shared.set_state(ConnectionState::DisconnectedRetrying);
                    self.event_handlers.emit_disconnected(reason);

                    if !self.options.auto_reconnect {
                        self.give_up(HassLinkError::ConnectionLost);
                        return;
                    }
                    match self.reconnect().await {
                        Some(new_ws) => ws = new_ws,
                        None => return,
                    }
                },
            }
        }
    }

    async fn serve_socket(&mut self, ws: &mut WebSocketStream) -> SocketOutcome {
        let has_keepalive = self.timeouts.has_keepalive();
        let keepalive_dur = if has_keepalive {
            self.timeouts.keepalive_interval
        } else {
            FAR_FUTURE
        };
        let pong_timeout_dur = self.timeouts.pong_timeout;
        let has_pong_timeout = has_keepalive && !pong_timeout_dur.is_zero();

        let mut idle_deadline = TokioInstant::now() + keepalive_dur;
        let mut awaiting_pong = false;
        let mut pong_deadline = TokioInstant::now() + FAR_FUTURE;

        loop {
            let idle_sleep = tokio::time::sleep_until(idle_deadline);
            tokio::pin!(idle_sleep);

            let pong_sleep = tokio::time::sleep_until(pong_deadline);
            tokio::pin!(pong_sleep);

            tokio::select! {
                biased;

                _ = &mut pong_sleep, if has_pong_timeout && awaiting_pong => {
                    return SocketOutcome::Lost(DisconnectReason::new(format!(
                        "No answer to keepalive within {:?}",
                        pong_timeout_dur
                    )));
                }

                cmd = self.cmd_rx.recv() => {
                    let frame = match cmd {
                        Some(ConnCmd::Send { command, reply }) => {
                            log::debug!("[hass-link] Sending '{}'", command.kind());
                            self.table.request(&command, reply)
                        },
                        Some(ConnCmd::Subscribe { command, callback, ack }) => {
                            self.table.subscribe(&command, callback, ack, true)
                        },
                        Some(ConnCmd::Unsubscribe { key, reply }) => {
                            self.table.unsubscribe(key, reply, true)
                        },
                        Some(ConnCmd::ListSubscriptions { reply }) => {
                            let _ = reply.send(self.table.list());
                            None
                        },
                        Some(ConnCmd::Close { reply }) => {
                            return SocketOutcome::CloseRequested(reply);
                        },
                        None => return SocketOutcome::CloseRequested(None),
                    };
                    if let Some(text) = frame {
                        if let Err(reason) = send_text(ws, text).await {
                            return SocketOutcome::Lost(reason);
                        }
                    }
                }

                _ = &mut idle_sleep, if has_keepalive && !awaiting_pong => {
                    let (reply, _) = oneshot::channel();
                    if let Some(text) = self.table.request(&HassCommand::Ping, reply) {
                        log::debug!("[hass-link] Keepalive: sending ping");
                        if let Err(reason) = send_text(ws, text).await {
                            return SocketOutcome::Lost(reason);
                        }
                    }
                    if has_pong_timeout {
                        awaiting_pong = true;
                        pong_deadline = TokioInstant::now() + pong_timeout_dur;
                    }
                    idle_deadline = TokioInstant::now() + keepalive_dur;
                }

                frame = ws.next() => {
                    idle_deadline = TokioInstant::now() + keepalive_dur;
                    if awaiting_pong {
                        awaiting_pong = false;
                        pong_deadline = TokioInstant::now() + FAR_FUTURE;
                    }

                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reply) = route_text(&mut self.table, &text, MAX_WS_TEXT_MESSAGE_BYTES) {
                                if let Err(reason) = send_text(ws, reply).await {
                                    return SocketOutcome::Lost(reason);
                                }
                            }
                        },
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        },
                        Some(Ok(Message::Close(frame))) => {
                            let reason = match frame {
                                Some(f) => DisconnectReason::with_code(f.reason.as_str(), f.code.into()),
                                None => DisconnectReason::new("Server closed connection"),
                            };
                            return SocketOutcome::Lost(reason);
                        },
                        Some(Ok(Message::Binary(data))) => {
                            log::debug!("[hass-link] Ignoring binary frame ({} bytes)", data.len());
                        },
                        Some(Ok(Message::Pong(_) | Message::Frame(_))) => {},
                        Some(Err(e)) => {
                            return SocketOutcome::Lost(DisconnectReason::new(format!(
                                "WebSocket error: {}",
                                e
                            )));
                        },
                        None => {
                            return SocketOutcome::Lost(DisconnectReason::new("WebSocket stream ended"));
                        },
                    }
                }
            }
        }
    }

    /// Rebuild the socket with linear backoff while still serving commands.
    ///
    /// Returns `None` once the connection is closed for good.
    async fn reconnect(&mut self) -> Option<WebSocketStream> {
        let mut retry_options = self.options.clone();
        retry_options.setup_retry = 0;
        let auth = self.auth.clone();
        let timeouts = self.timeouts.clone();

        let mut attempt: u32 = 0;
        loop {
            if let Some(max) = self.options.max_reconnect_attempts {
                if attempt >= max {
                    log::warn!("[hass-link] Max reconnection attempts ({}) reached", max);
                    self.give_up(HassLinkError::CannotConnect(format!(
                        "Gave up after {} reconnection attempt(s)",
                        max
                    )));
                    return None;
                }
            }

            let delay = self.options.reconnect_delay(attempt);
            log::info!(
                "[hass-link] Reconnecting in {:?} (attempt {})",
                delay,
                attempt + 1
            );

            let sleep_fut = tokio::time::sleep(delay);
            tokio::pin!(sleep_fut);
            loop {
                tokio::select! {
                    biased;
                    cmd = self.cmd_rx.recv() => {
                        if let Offline::Close(reply) = handle_offline_command(&mut self.table, cmd) {
                            self.shutdown(reply);
                            return None;
                        }
                    }
                    _ = &mut sleep_fut => break,
                }
            }

            let connect_fut = create_authenticated_socket(&retry_options, auth.as_ref(), &timeouts);
            tokio::pin!(connect_fut);
            let result = loop {
                tokio::select! {
                    biased;
                    cmd = self.cmd_rx.recv() => {
                        if let Offline::Close(reply) = handle_offline_command(&mut self.table, cmd) {
                            self.shutdown(reply);
                            return None;
                        }
                    }
                    result = &mut connect_fut => break result,
                }
            };

            match result {
                Ok(socket) => {
                    let mut ws = socket.stream;
                    self.shared.set_ha_version(socket.ha_version);

                    let mut resubscribed = true;
                    for text in self.table.reset_for_new_socket() {
                        if let Err(reason) = send_text(&mut ws, text).await {
                            log::warn!("[hass-link] Re-subscribe failed: {}", reason);
                            resubscribed = false;
                            break;
                        }
                    }
                    if !resubscribed {
                        self.table.reject_requests();
                        attempt = attempt.saturating_add(1);
                        continue;
                    }

                    self.shared.set_state(ConnectionState::Connected);
                    log::info!("[hass-link] Reconnected after {} attempt(s)", attempt + 1);
                    self.event_handlers.emit_ready();
                    return Some(ws);
                },
                Err(e) if e.is_fatal() => {
                    self.give_up(e);
                    return None;
                },
                Err(e) => {
                    log::info!("[hass-link] Reconnection attempt {} failed: {}", attempt + 1, e);
                    attempt = attempt.saturating_add(1);
                },
            }
        }
    }

    /// Deliberate close: reject everything outstanding, no events.
    fn shutdown(&mut self, reply: Option<oneshot::Sender<()>>) {
        self.table.reject_requests();
        self.table.fail_subscriptions(&HassLinkError::Closed);
        self.shared.set_state(ConnectionState::Closed);
        self.drain_commands();
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }

    /// Reconnection gave up: close and report `error` as `reconnect-error`.
    fn give_up(&mut self, error: HassLinkError) {
        log::warn!("[hass-link] Giving up reconnecting: {}", error);
        self.table.fail_subscriptions(&HassLinkError::Closed);
        self.shared.set_state(ConnectionState::Closed);
        self.event_handlers.emit_reconnect_error(error);
        self.drain_commands();
    }

    /// Refuse new commands and answer the ones already queued with `Closed`.
    fn drain_commands(&mut self) {
        self.cmd_rx.close();
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                ConnCmd::Send { reply, .. } | ConnCmd::Unsubscribe { reply, .. } => {
                    let _ = reply.send(Err(HassLinkError::Closed));
                },
                ConnCmd::Subscribe { ack, .. } => {
                    let _ = ack.send(Err(HassLinkError::Closed));
                },
                ConnCmd::ListSubscriptions { reply } => {
                    let _ = reply.send(Vec::new());
                },
                ConnCmd::Close { reply } => {
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                },
            }
        }
    }
}

fn handle_offline_command(table: &mut CommandTable, cmd: Option<ConnCmd>) -> Offline {
    match cmd {
        Some(ConnCmd::Send { command, reply }) => {
            log::debug!("[hass-link] Rejecting '{}' while reconnecting", command.kind());
            let _ = reply.send(Err(HassLinkError::ConnectionLost));
            Offline::Continue
        },
        Some(ConnCmd::Subscribe { command, callback, ack }) => {
            table.subscribe(&command, callback, ack, false);
            Offline::Continue
        },
        Some(ConnCmd::Unsubscribe { key, reply }) => {
            table.unsubscribe(key, reply, false);
            Offline::Continue
        },
        Some(ConnCmd::ListSubscriptions { reply }) => {
            let _ = reply.send(table.list());
            Offline::Continue
        },
        Some(ConnCmd::Close { reply }) => Offline::Close(reply),
        None => Offline::Close(None),
    }
}

/// Bare routing fields, read from frames that do not decode as [`ServerMessage`].
#[derive(Deserialize)]
struct FrameHeader {
    id: Option<u64>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// Decode one text frame and route it; returns a frame to send back, if any.
///
/// A frame that is too large or does not decode still settles the command
/// its `id` names, so no caller waits on a reply that was thrown away.
fn route_text(table: &mut CommandTable, text: &str, max_bytes: usize) -> Option<String> {
    if text.len() > max_bytes {
        let error = HassLinkError::SerializationError(format!(
            "Text message too large ({} bytes, limit {})",
            text.len(),
            max_bytes
        ));
        reject_frame(table, text, error);
        return None;
    }
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(message) => table.handle_message(message),
        Err(e) => {
            let error = HassLinkError::SerializationError(format!("Undecodable frame: {}", e));
            reject_frame(table, text, error);
            None
        },
    }
}

fn reject_frame(table: &mut CommandTable, text: &str, error: HassLinkError) {
    match serde_json::from_str::<FrameHeader>(text) {
        Ok(FrameHeader { id: Some(id), kind }) => {
            log::warn!(
                "[hass-link] Frame for command {} ({}): {}",
                id,
                kind.as_deref().unwrap_or("no type"),
                error
            );
            table.reject_undecodable(id, kind.as_deref(), error);
        },
        _ => log::warn!("[hass-link] Ignoring unrecognised frame: {}", error),
    }
}

async fn send_text(ws: &mut WebSocketStream, text: String) -> Result<(), DisconnectReason> {
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| DisconnectReason::new(format!("Failed to send frame: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value as JsonValue};

    fn pending_request(table: &mut CommandTable) -> oneshot::Receiver<crate::error::Result<JsonValue>> {
        let (tx, rx) = oneshot::channel();
        table.request(&HassCommand::GetStates, tx);
        rx
    }

    #[test]
    fn test_integer_error_code_settles_request() {
        let mut table = CommandTable::new();
        let mut rx = pending_request(&mut table);

        let frame = r#"{"id":1,"type":"result","success":false,"error":{"code":3,"message":"Entity not found"}}"#;
        assert!(route_text(&mut table, frame, MAX_WS_TEXT_MESSAGE_BYTES).is_none());
        match rx.try_recv().unwrap() {
            Err(HassLinkError::CommandFailed(detail)) => {
                assert_eq!(detail.code, crate::models::ErrorCode::Number(3));
                assert_eq!(detail.message, "Entity not found");
            },
            other => panic!("Expected CommandFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_undecodable_result_settles_request() {
        let mut table = CommandTable::new();
        let mut rx = pending_request(&mut table);

        let frame = json!({"id": 1, "type": "result", "success": "maybe"}).to_string();
        assert!(route_text(&mut table, &frame, MAX_WS_TEXT_MESSAGE_BYTES).is_none());
        assert!(matches!(rx.try_recv().unwrap(), Err(HassLinkError::SerializationError(_))));
    }

    #[test]
    fn test_oversized_result_settles_request() {
        let mut table = CommandTable::new();
        let mut rx = pending_request(&mut table);

        let frame = json!({"id": 1, "type": "result", "success": true, "result": "x".repeat(256)})
            .to_string();
        assert!(route_text(&mut table, &frame, 64).is_none());
        match rx.try_recv().unwrap() {
            Err(HassLinkError::SerializationError(msg)) => assert!(msg.contains("too large"), "{}", msg),
            other => panic!("Expected SerializationError, got {:?}", other),
        }
    }

    #[test]
    fn test_garbage_without_id_is_ignored() {
        let mut table = CommandTable::new();
        let mut rx = pending_request(&mut table);

        assert!(route_text(&mut table, "not json", MAX_WS_TEXT_MESSAGE_BYTES).is_none());
        assert!(route_text(&mut table, r#"{"type":"mystery"}"#, MAX_WS_TEXT_MESSAGE_BYTES).is_none());
        assert!(rx.try_recv().is_err(), "request still pending");
    }
}
