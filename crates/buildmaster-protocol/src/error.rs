//! Error types for the RPC protocol.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes returned in RPC error responses.
///
/// These codes are stable and used for automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The presented credential did not verify. The connection is closed.
    AuthenticationFailed,
    /// Malformed frame, missing required fields, or invalid field values.
    InvalidRequest,
    /// The command is not registered on this master.
    UnknownCommand,
    /// A leader-only command reached an instance that is not the leader.
    NotLeader,
    /// The broker did not confirm a publish within the retry budget.
    BrokerUnavailable,
    /// TLS peer validation failed on an outbound call.
    CertificateError,
    /// A downstream service (poller, secrets) returned an error.
    ServiceError,
    /// A bounded operation exceeded its deadline.
    Timeout,
    /// Unexpected failure inside the master.
    Internal,
}

impl ErrorCode {
    /// Whether a caller may reasonably retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotLeader | Self::BrokerUnavailable | Self::Timeout
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthenticationFailed => write!(f, "AUTHENTICATION_FAILED"),
            Self::InvalidRequest => write!(f, "INVALID_REQUEST"),
            Self::UnknownCommand => write!(f, "UNKNOWN_COMMAND"),
            Self::NotLeader => write!(f, "NOT_LEADER"),
            Self::BrokerUnavailable => write!(f, "BROKER_UNAVAILABLE"),
            Self::CertificateError => write!(f, "CERTIFICATE_ERROR"),
            Self::ServiceError => write!(f, "SERVICE_ERROR"),
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::Internal => write!(f, "INTERNAL"),
        }
    }
}

/// RPC error response payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code from the registry.
    pub code: ErrorCode,
    /// Human-readable, single-line error message.
    /// Must not contain credentials or stack traces.
    pub message: String,
    /// Optional machine-readable details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    /// Create a new RPC error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Create a new RPC error with additional data.
    pub fn with_data(code: ErrorCode, message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Create an AUTHENTICATION_FAILED error.
    ///
    /// The message is fixed so nothing about the presented secret leaks.
    pub fn authentication_failed() -> Self {
        Self::new(ErrorCode::AuthenticationFailed, "authentication failed")
    }

    /// Create an INVALID_REQUEST error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    /// Create an UNKNOWN_COMMAND error.
    pub fn unknown_command(command: &str) -> Self {
        Self::with_data(
            ErrorCode::UnknownCommand,
            format!("unknown command: {}", command),
            serde_json::json!({ "command": command }),
        )
    }

    /// Create a NOT_LEADER error carrying the role this instance holds.
    pub fn not_leader(role: &str) -> Self {
        Self::with_data(
            ErrorCode::NotLeader,
            format!("this instance is not the leader (role: {})", role),
            serde_json::json!({ "role": role }),
        )
    }

    /// Create a BROKER_UNAVAILABLE error.
    pub fn broker_unavailable(attempts: u32) -> Self {
        Self::with_data(
            ErrorCode::BrokerUnavailable,
            format!("broker did not confirm publish after {} attempts", attempts),
            serde_json::json!({ "attempts": attempts }),
        )
    }

    /// Create a CERTIFICATE_ERROR error.
    pub fn certificate(endpoint: &str) -> Self {
        Self::with_data(
            ErrorCode::CertificateError,
            format!("peer certificate for {} failed validation", endpoint),
            serde_json::json!({ "endpoint": endpoint }),
        )
    }

    /// Create a SERVICE_ERROR error.
    pub fn service(service: &str, message: impl Into<String>) -> Self {
        Self::with_data(
            ErrorCode::ServiceError,
            message,
            serde_json::json!({ "service": service }),
        )
    }

    /// Create a TIMEOUT error for the named operation.
    pub fn timeout(operation: &str, after_ms: u64) -> Self {
        Self::with_data(
            ErrorCode::Timeout,
            format!("{} timed out after {} ms", operation, after_ms),
            serde_json::json!({ "operation": operation, "after_ms": after_ms }),
        )
    }

    /// Create an INTERNAL error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}
