//! Data models for the Home Assistant WebSocket protocol.
//!
//! Defines the authentication-phase messages, the commands the client sends,
//! the frames the server sends back, and the connection options.

pub mod auth_message;
pub mod command;
pub mod connection_options;
pub mod error_detail;
pub mod hass_event;
pub mod server_message;
pub mod subscription_info;


pub use auth_message::AuthMessage;
pub use command::HassCommand;
pub use connection_options::ConnectionOptions;
pub use error_detail::{ErrorCode, ErrorDetail};
pub use hass_event::{EventContext, HassEvent};
pub use server_message::ServerMessage;
pub use subscription_info::SubscriptionInfo;
