//! RPC request types.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ops::names;

/// RPC request envelope sent by clients of the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Caller-chosen correlation id, echoed in the response.
    pub id: String,
    /// Command name.
    pub command: String,
    /// Command-specific arguments.
    #[serde(default)]
    pub args: serde_json::Value,
}

impl Request {
    /// Create a request.
    pub fn new(id: impl Into<String>, command: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            args,
        }
    }

    /// Create the credential frame that must open every connection.
    pub fn authenticate(id: impl Into<String>, token: impl Into<String>) -> Self {
        Self::new(
            id,
            names::AUTHENTICATE,
            serde_json::json!({ "token": token.into() }),
        )
    }

    /// Whether this is the credential frame.
    pub fn is_authenticate(&self) -> bool {
        self.command == names::AUTHENTICATE
    }

    /// The presented token, if this is a well-formed credential frame.
    pub fn token(&self) -> Option<&str> {
        if !self.is_authenticate() {
            return None;
        }
        self.args.get("token").and_then(|t| t.as_str())
    }
}

/// Request envelope sent by the master to the poller and secrets services.
///
/// Every call carries the endpoint's token; `Debug` never prints it.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServiceRequest {
    /// Service action name.
    pub action: String,
    /// Endpoint credential.
    pub token: String,
    /// Action-specific body.
    #[serde(default)]
    pub body: serde_json::Value,
}

impl ServiceRequest {
    /// Create a service request.
    pub fn new(action: impl Into<String>, token: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            action: action.into(),
            token: token.into(),
            body,
        }
    }
}

impl fmt::Debug for ServiceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRequest")
            .field("action", &self.action)
            .field("token", &"[REDACTED]")
            .field("body", &self.body)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authenticate_frame_exposes_token() {
        let req = Request::authenticate("c-1", "abc123");
        assert!(req.is_authenticate());
        assert_eq!(req.token(), Some("abc123"));
    }

    #[test]
    fn test_token_only_read_from_authenticate() {
        let req = Request::new("c-2", "healthcheck", serde_json::json!({ "token": "abc123" }));
        assert_eq!(req.token(), None);
    }

    #[test]
    fn test_missing_args_default_to_null() {
        let req: Request = serde_json::from_str(r#"{"id":"1","command":"healthcheck"}"#).unwrap();
        assert!(req.args.is_null());
    }

    #[test]
    fn test_service_request_debug_redacts_token() {
        let req = ServiceRequest::new("poll", "very-secret", serde_json::json!({}));
        let debug = format!("{:?}", req);
        assert!(!debug.contains("very-secret"));
        assert!(debug.contains("REDACTED"));
    }
}
