use std::fmt;

use serde::{Deserialize, Serialize};

/// Error payload carried by a failed `result` frame.
///
/// ```json
/// {"id": 4, "type": "result", "success": false,
///  "error": {"code": "not_found", "message": "Service not found."}}
/// ```
///
/// Older servers send integer codes and may omit `message`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorDetail {
    /// Machine-readable error code (e.g. `not_found`, `invalid_format`, `3`)
    #[serde(default)]
    pub code: ErrorCode,

    /// Human-readable error message
    #[serde(default)]
    pub message: String,
}

impl ErrorDetail {
    pub fn new(code: impl Into<ErrorCode>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Placeholder used when the server reports failure without details.
    pub(crate) fn unspecified() -> Self {
        Self::new("unknown_error", "Server reported failure without error details")
    }
}

/// A result error code, as sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum ErrorCode {
    Number(i64),
    Text(String),
}

impl Default for ErrorCode {
    fn default() -> Self {
        Self::Text("unknown_error".to_string())
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(code) => write!(f, "{}", code),
            Self::Text(code) => f.write_str(code),
        }
    }
}

impl From<&str> for ErrorCode {
    fn from(code: &str) -> Self {
        Self::Text(code.to_string())
    }
}

impl From<String> for ErrorCode {
    fn from(code: String) -> Self {
        Self::Text(code)
    }
}

impl From<i64> for ErrorCode {
    fn from(code: i64) -> Self {
        Self::Number(code)
    }
}
