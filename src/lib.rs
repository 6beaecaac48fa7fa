//! # hass-link: Home Assistant WebSocket Client
//!
//! An async client for the Home Assistant WebSocket API.
//!
//! ## Features
//!
//! - **Authentication**: `auth` handshake with long-lived or refreshable tokens
//! - **Command Multiplexing**: one-shot commands and subscriptions over one socket
//! - **Automatic Reconnection**: linear backoff, subscriptions re-issued on the new socket
//! - **Lifecycle Events**: `ready`, `disconnected` and `reconnect-error` listeners
//! - **Configurable Timeouts**: dial, handshake and optional keepalive
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hass_link::{Connection, ConnectionOptions, EventHandlers};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connection = Connection::builder()
//!         .options(ConnectionOptions::new("http://homeassistant.local:8123"))
//!         .access_token("your-long-lived-token")
//!         .event_handlers(
//!             EventHandlers::new()
//!                 .on_disconnected(|reason| eprintln!("Disconnected: {}", reason))
//!                 .on_ready(|| eprintln!("Reconnected")),
//!         )
//!         .connect()
//!         .await?;
//!
//!     connection
//!         .call_service("light", "turn_on", Some(serde_json::json!({"entity_id": "light.kitchen"})))
//!         .await?;
//!
//!     let _subscription = connection
//!         .subscribe_events(|event| println!("{}", event), Some("state_changed"))
//!         .await?;
//!     tokio::signal::ctrl_c().await?;
//!     connection.close().await;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod event_handlers;
pub mod models;
pub mod socket;
pub mod subscription;
pub mod timeouts;

// Re-export main types for convenience
pub use auth::{Auth, AuthProvider, LongLivedToken};
pub use config::LinkConfiguration;
pub use connection::{Connection, ConnectionBuilder, ConnectionState};
pub use credentials::{AuthData, FileTokenStore, MemoryTokenStore, TokenStore};
pub use error::{HassLinkError, Result};
pub use event_handlers::{
    ConnectionEvent, ConnectionEventKind, DisconnectReason, EventHandlers, ListenerId,
};
pub use models::{
    ConnectionOptions, ErrorCode, ErrorDetail, EventContext, HassCommand, HassEvent, ServerMessage,
    SubscriptionInfo,
};
pub use socket::{create_authenticated_socket, resolve_ws_url, AuthenticatedSocket};
pub use subscription::Subscription;
pub use timeouts::HassLinkTimeouts;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
