//! RPC response types.

use serde::{Deserialize, Serialize};
use crate::error::RpcError;

/// RPC response envelope.
///
/// Used both for master replies and for poller/secrets service replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Correlation id echoed from the request (empty when the request could
    /// not be parsed far enough to read it).
    #[serde(default)]
    pub id: String,
    /// Whether the command succeeded.
    pub ok: bool,
    /// Success body (present when ok=true).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    /// Error details (present when ok=false).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    /// Create a success response.
    pub fn success(id: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            body: Some(body),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(id: impl Into<String>, error: RpcError) -> Self {
        Self {
            id: id.into(),
            ok: false,
            body: None,
            error: Some(error),
        }
    }

    /// Convert into the body or the carried error.
    pub fn into_result(self) -> Result<serde_json::Value, RpcError> {
        if self.ok {
            Ok(self.body.unwrap_or(serde_json::Value::Null))
        } else {
            Err(self
                .error
                .unwrap_or_else(|| RpcError::internal("error response without details")))
        }
    }
}
