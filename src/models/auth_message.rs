use serde::{Deserialize, Serialize};

/// Messages the client sends during the authentication phase.
///
/// These carry no command id; the socket is not multiplexed until the
/// server has answered with `auth_ok`.
///
/// ```json
/// {"type": "auth", "access_token": "ABCDEFGH"}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMessage {
    /// Present a bearer token to the server
    Auth { access_token: String },
}

impl AuthMessage {
    pub fn auth(access_token: impl Into<String>) -> Self {
        Self::Auth {
            access_token: access_token.into(),
        }
    }
}
