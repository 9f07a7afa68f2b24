//! Notification payload types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Arguments for `send-email`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendEmailArgs {
    pub recipients: Vec<String>,
    pub subject: String,
    pub message: String,
}

/// Status update posted to the notification endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Lifecycle event name (e.g. "buildset-added").
    pub event_type: String,
    pub repository_id: String,
    /// Status carried by the event (e.g. "pending").
    pub status: String,
    /// Event-specific details.
    #[serde(default)]
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl StatusUpdate {
    /// Create a status update stamped with the current time.
    pub fn new(
        event_type: impl Into<String>,
        repository_id: impl Into<String>,
        status: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            repository_id: repository_id.into(),
            status: status.into(),
            details,
            timestamp: Utc::now(),
        }
    }
}
