//! Connection lifecycle events.
//!
//! A [`Connection`](crate::Connection) reports three events:
//!
//! - `ready`: a replacement socket is authenticated and subscriptions have
//!   been re-issued on it
//! - `disconnected`: the socket was lost unexpectedly; reconnection starts
//! - `reconnect-error`: reconnection gave up (credentials rejected or the
//!   attempt limit reached); the connection is closed for good
//!
//! Listeners can be registered up front through the builder methods, or at
//! any time with [`EventHandlers::add_listener`] /
//! [`Connection::add_event_listener`](crate::Connection::add_event_listener).
//!
//! # Example
//!
//! ```rust
//! use hass_link::EventHandlers;
//!
//! let handlers = EventHandlers::new()
//!     .on_ready(|| println!("Back online"))
//!     .on_disconnected(|reason| println!("Lost connection: {}", reason))
//!     .on_reconnect_error(|err| eprintln!("Giving up: {}", err));
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::HassLinkError;

/// Reason for a disconnect event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReason {
    /// Human-readable description of why the connection closed.
    pub message: String,
    /// WebSocket close code, if the server sent one.
    pub code: Option<u16>,
}

impl DisconnectReason {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: u16) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "{} (code: {})", self.message, code)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// Event names listeners can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEventKind {
    Ready,
    Disconnected,
    ReconnectError,
}

impl ConnectionEventKind {
    /// Name used by Home Assistant clients for this event.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
            Self::ReconnectError => "reconnect-error",
        }
    }
}

impl fmt::Display for ConnectionEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event with its payload.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Ready,
    Disconnected(DisconnectReason),
    ReconnectError(HassLinkError),
}

impl ConnectionEvent {
    pub fn kind(&self) -> ConnectionEventKind {
        match self {
            Self::Ready => ConnectionEventKind::Ready,
            Self::Disconnected(_) => ConnectionEventKind::Disconnected,
            Self::ReconnectError(_) => ConnectionEventKind::ReconnectError,
        }
    }
}

/// Handle returned by [`EventHandlers::add_listener`], used to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Type alias for listener callbacks.
pub type ListenerCallback = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(ListenerId, ConnectionEventKind, ListenerCallback)>,
}

/// Shared registry of lifecycle listeners.
///
/// Cloning is cheap; clones share the same registry, so a listener added
/// through the [`Connection`](crate::Connection) is seen by the background
/// task that fires events.
#[derive(Clone, Default)]
pub struct EventHandlers {
    inner: Arc<Mutex<Listeners>>,
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.lock();
        f.debug_struct("EventHandlers")
            .field("listeners", &guard.entries.len())
            .finish()
    }
}

impl EventHandlers {
    /// Create a new empty `EventHandlers` (no listeners registered).
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Listeners> {
        // Listeners never panic while the lock is held; a poisoned lock still
        // holds a consistent list.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a listener for `kind`; returns an id for removal.
    pub fn add_listener(
        &self,
        kind: ConnectionEventKind,
        f: impl Fn(&ConnectionEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let mut guard = self.lock();
        guard.next_id += 1;
        let id = ListenerId(guard.next_id);
        guard.entries.push((id, kind, Arc::new(f)));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut guard = self.lock();
        let before = guard.entries.len();
        guard.entries.retain(|(entry_id, _, _)| *entry_id != id);
        guard.entries.len() != before
    }

    /// Register a callback fired when a replacement socket is ready.
    pub fn on_ready(self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.add_listener(ConnectionEventKind::Ready, move |_| f());
        self
    }

    /// Register a callback fired when the socket is lost unexpectedly.
    pub fn on_disconnected(self, f: impl Fn(&DisconnectReason) + Send + Sync + 'static) -> Self {
        self.add_listener(ConnectionEventKind::Disconnected, move |event| {
            if let ConnectionEvent::Disconnected(reason) = event {
                f(reason);
            }
        });
        self
    }

    /// Register a callback fired when reconnection gives up.
    pub fn on_reconnect_error(
        self,
        f: impl Fn(&HassLinkError) + Send + Sync + 'static,
    ) -> Self {
        self.add_listener(ConnectionEventKind::ReconnectError, move |event| {
            if let ConnectionEvent::ReconnectError(err) = event {
                f(err);
            }
        });
        self
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns `true` if no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every listener registered for the event's kind.
    ///
    /// Callbacks run outside the registry lock, so a listener may add or
    /// remove listeners.
    pub(crate) fn emit(&self, event: &ConnectionEvent) {
        let kind = event.kind();
        let callbacks: Vec<ListenerCallback> = self
            .lock()
            .entries
            .iter()
            .filter(|(_, entry_kind, _)| *entry_kind == kind)
            .map(|(_, _, cb)| cb.clone())
            .collect();
        log::debug!("[hass-link] Firing '{}' to {} listener(s)", kind, callbacks.len());
        for cb in callbacks {
            cb(event);
        }
    }

    pub(crate) fn emit_ready(&self) {
        self.emit(&ConnectionEvent::Ready);
    }

    pub(crate) fn emit_disconnected(&self, reason: DisconnectReason) {
        self.emit(&ConnectionEvent::Disconnected(reason));
    }

    pub(crate) fn emit_reconnect_error(&self, error: HassLinkError) {
        self.emit(&ConnectionEvent::ReconnectError(error));
    }
}
