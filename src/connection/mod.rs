//! Home Assistant connection with automatic reconnection.
//!
//! A [`Connection`] owns one authenticated WebSocket at a time and
//! multiplexes one-shot commands and long-lived subscriptions over it.
//!
//! - Command ids start at 1 on every socket and increase strictly
//! - A `result` frame settles exactly one pending command
//! - Losing the socket rejects outstanding commands with
//!   [`HassLinkError::ConnectionLost`], fires `disconnected`, and starts
//!   reconnecting with linear backoff
//! - Subscriptions survive reconnects: they are re-issued on the new socket
//!   under new ids while the caller keeps the same [`Subscription`] handle
//!
//! # Example
//!
//! ```rust,no_run
//! use hass_link::{Connection, ConnectionOptions};
//!
//! # async fn example() -> hass_link::Result<()> {
//! let connection = Connection::builder()
//!     .options(ConnectionOptions::new("http://homeassistant.local:8123").with_setup_retry(3))
//!     .access_token("eyJhbGc...")
//!     .connect()
//!     .await?;
//!
//! let states = connection.get_states().await?;
//! println!("{} entities", states.as_array().map_or(0, Vec::len));
//!
//! let subscription = connection
//!     .subscribe_events(|event| println!("{}", event), Some("state_changed"))
//!     .await?;
//! // ...
//! subscription.unsubscribe().await?;
//! connection.close().await;
//! # Ok(())
//! # }
//! ```

mod table;
mod task;

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};

use crate::{
    auth::{ArcAuthProvider, AuthProvider, LongLivedToken},
    error::{HassLinkError, Result},
    event_handlers::{ConnectionEvent, ConnectionEventKind, EventHandlers, ListenerId},
    models::{ConnectionOptions, HassCommand, SubscriptionInfo},
    socket::create_authenticated_socket,
    subscription::Subscription,
    timeouts::HassLinkTimeouts,
};

pub use table::EventCallback;
pub(crate) use task::ConnCmd;
use table::CommandTable;
use task::ConnectionTask;

/// Capacity of the command channel between handles and the background task.
const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Reconnector state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// An authenticated socket is live
    Connected,
    /// The socket was lost; a replacement is being built
    DisconnectedRetrying,
    /// Closed by the caller, or reconnection gave up. Terminal.
    Closed,
}

impl ConnectionState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Connected => 0,
            Self::DisconnectedRetrying => 1,
            Self::Closed => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connected,
            1 => Self::DisconnectedRetrying,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connected => "connected",
            Self::DisconnectedRetrying => "disconnected (retrying)",
            Self::Closed => "closed",
        })
    }
}

/// State the background task publishes to the handles.
pub(crate) struct SharedState {
    state: AtomicU8,
    ha_version: RwLock<Option<String>>,
}

impl SharedState {
    fn new(ha_version: Option<String>) -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Connected.as_u8()),
            ha_version: RwLock::new(ha_version),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let previous = self.state.swap(state.as_u8(), Ordering::SeqCst);
        if previous != state.as_u8() {
            log::debug!(
                "[hass-link] State {} -> {}",
                ConnectionState::from_u8(previous),
                state
            );
        }
    }

    pub(crate) fn ha_version(&self) -> Option<String> {
        self.ha_version
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn set_ha_version(&self, version: Option<String>) {
        if version.is_some() {
            *self
                .ha_version
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = version;
        }
    }
}

/// Builder for [`Connection`].
#[derive(Default)]
pub struct ConnectionBuilder {
    options: ConnectionOptions,
    auth: Option<ArcAuthProvider>,
    timeouts: HassLinkTimeouts,
    event_handlers: EventHandlers,
}

impl ConnectionBuilder {
    /// Set the Home Assistant base URL, keeping the other options.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.options.url = url.into();
        self
    }

    /// Replace all connection options.
    pub fn options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Authenticate with a long-lived access token.
    pub fn access_token(self, token: impl Into<String>) -> Self {
        self.auth(LongLivedToken::new(token))
    }

    /// Authenticate through `provider`.
    pub fn auth(mut self, provider: impl AuthProvider) -> Self {
        self.auth = Some(Arc::new(provider));
        self
    }

    /// Authenticate through a provider the caller keeps a handle to.
    pub fn auth_provider(mut self, provider: ArcAuthProvider) -> Self {
        self.auth = Some(provider);
        self
    }

    pub fn timeouts(mut self, timeouts: HassLinkTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Listeners registered before the first socket is opened.
    pub fn event_handlers(mut self, handlers: EventHandlers) -> Self {
        self.event_handlers = handlers;
        self
    }

    /// Open and authenticate the first socket, then start the background task.
    ///
    /// Fails with the handshake error (after the `setup_retry` budget) rather
    /// than entering the reconnect loop.
    pub async fn connect(self) -> Result<Connection> {
        let auth = self.auth.ok_or_else(|| {
            HassLinkError::ConfigurationError("An auth provider is required".to_string())
        })?;

        let socket = create_authenticated_socket(&self.options, auth.as_ref(), &self.timeouts).await?;

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let shared = Arc::new(SharedState::new(socket.ha_version.clone()));

        let task = ConnectionTask {
            cmd_rx,
            options: self.options,
            timeouts: self.timeouts,
            auth,
            event_handlers: self.event_handlers.clone(),
            shared: shared.clone(),
            table: CommandTable::new(),
        };
        tokio::spawn(task.run(socket.stream));

        Ok(Connection {
            cmd_tx,
            shared,
            event_handlers: self.event_handlers,
        })
    }
}

/// Handle to a Home Assistant connection.
///
/// Dropping the handle closes the connection.  Wrap it in an `Arc` to share
/// it between tasks.
pub struct Connection {
    cmd_tx: mpsc::Sender<ConnCmd>,
    shared: Arc<SharedState>,
    event_handlers: EventHandlers,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("ha_version", &self.ha_version())
            .finish()
    }
}

impl Connection {
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::default()
    }

    /// Connect with `options`, authenticating through `auth`.
    pub async fn connect(options: ConnectionOptions, auth: ArcAuthProvider) -> Result<Self> {
        Self::builder().options(options).auth_provider(auth).connect().await
    }

    /// Current reconnector state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Home Assistant version reported by the most recent handshake.
    pub fn ha_version(&self) -> Option<String> {
        self.shared.ha_version()
    }

    async fn dispatch(&self, cmd: ConnCmd) -> Result<()> {
        if self.state() == ConnectionState::Closed {
            return Err(HassLinkError::Closed);
        }
        self.cmd_tx.send(cmd).await.map_err(|_| HassLinkError::Closed)
    }

    /// Send `command` and wait for its `result`.
    ///
    /// Resolves with the `result` payload (`null` when absent), or fails
    /// with [`HassLinkError::CommandFailed`] carrying the server's error.
    /// While reconnecting the command is rejected at once with
    /// [`HassLinkError::ConnectionLost`].
    pub async fn send_message(&self, command: HassCommand) -> Result<JsonValue> {
        let (reply, reply_rx) = oneshot::channel();
        self.dispatch(ConnCmd::Send { command, reply }).await?;
        reply_rx.await.map_err(|_| HassLinkError::Closed)?
    }

    /// Send a subscribe command and route its events to `callback`.
    ///
    /// Completes once the server acknowledges the subscription.  Issued
    /// while reconnecting, the subscription is queued and acknowledged on
    /// the next socket.  The callback runs on the connection task and must
    /// not block.
    pub async fn subscribe_message<F>(&self, callback: F, command: HassCommand) -> Result<Subscription>
    where
        F: Fn(JsonValue) + Send + Sync + 'static,
    {
        let (ack, ack_rx) = oneshot::channel();
        self.dispatch(ConnCmd::Subscribe {
            command,
            callback: Arc::new(callback),
            ack,
        })
        .await?;
        let key = ack_rx.await.map_err(|_| HassLinkError::Closed)??;
        Ok(Subscription::new(key, self.cmd_tx.clone()))
    }

    /// Subscribe to bus events, optionally only those of `event_type`.
    pub async fn subscribe_events<F>(&self, callback: F, event_type: Option<&str>) -> Result<Subscription>
    where
        F: Fn(JsonValue) + Send + Sync + 'static,
    {
        self.subscribe_message(callback, HassCommand::subscribe_events(event_type))
            .await
    }

    /// Round-trip a `ping`.
    pub async fn ping(&self) -> Result<()> {
        self.send_message(HassCommand::Ping).await.map(|_| ())
    }

    pub async fn get_states(&self) -> Result<JsonValue> {
        self.send_message(HassCommand::GetStates).await
    }

    pub async fn get_config(&self) -> Result<JsonValue> {
        self.send_message(HassCommand::GetConfig).await
    }

    pub async fn get_services(&self) -> Result<JsonValue> {
        self.send_message(HassCommand::GetServices).await
    }

    pub async fn get_panels(&self) -> Result<JsonValue> {
        self.send_message(HassCommand::GetPanels).await
    }

    /// The user the connection is authenticated as.
    pub async fn get_user(&self) -> Result<JsonValue> {
        self.send_message(HassCommand::CurrentUser).await
    }

    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        service_data: Option<JsonValue>,
    ) -> Result<JsonValue> {
        self.send_message(HassCommand::call_service(domain, service, service_data))
            .await
    }

    /// Snapshot of the active subscriptions.
    pub async fn list_subscriptions(&self) -> Vec<SubscriptionInfo> {
        let (reply, reply_rx) = oneshot::channel();
        if self.dispatch(ConnCmd::ListSubscriptions { reply }).await.is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Register a lifecycle listener.
    pub fn add_event_listener(
        &self,
        kind: ConnectionEventKind,
        f: impl Fn(&ConnectionEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.event_handlers.add_listener(kind, f)
    }

    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.event_handlers.remove_listener(id)
    }

    /// Close the socket and stop reconnecting.
    ///
    /// Outstanding commands are rejected; subscriptions are dropped.  Safe
    /// to call more than once.
    pub async fn close(&self) {
        let (reply, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(ConnCmd::Close { reply: Some(reply) })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.cmd_tx.try_send(ConnCmd::Close { reply: None });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_u8() {
        for state in [
            ConnectionState::Connected,
            ConnectionState::DisconnectedRetrying,
            ConnectionState::Closed,
        ] {
            assert_eq!(ConnectionState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn test_shared_state_keeps_version_when_none_reported() {
        let shared = SharedState::new(Some("2024.6.0".to_string()));
        shared.set_ha_version(None);
        assert_eq!(shared.ha_version().as_deref(), Some("2024.6.0"));
        shared.set_ha_version(Some("2024.7.0".to_string()));
        assert_eq!(shared.ha_version().as_deref(), Some("2024.7.0"));
    }

    #[tokio::test]
    async fn test_connect_without_auth_is_rejected() {
        let err = Connection::builder()
            .url("http://localhost:8123")
            .connect()
            .await
            .unwrap_err();
        assert!(matches!(err, HassLinkError::ConfigurationError(_)));
    }

    #[tokio::test]
    async fn test_connect_without_url_requires_host() {
        let err = Connection::builder()
            .access_token("token")
            .connect()
            .await
            .unwrap_err();
        assert!(matches!(err, HassLinkError::HostRequired));
    }
}
