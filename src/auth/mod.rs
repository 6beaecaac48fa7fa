//! Authentication for the Home Assistant WebSocket API.

pub mod provider;
pub mod tokens;

pub use provider::{ArcAuthProvider, AuthProvider, LongLivedToken};
pub use tokens::Auth;
