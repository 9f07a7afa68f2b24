//! Health and leadership status replies.

use serde::{Deserialize, Serialize};

/// Reply to `healthcheck`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthcheckReply {
    pub status: String,
    pub role: String,
    pub instance_id: String,
    pub version: String,
}

/// Reply to `leader-status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderStatusReply {
    pub role: String,
    pub instance_id: String,
    /// Path of this instance's election node, when registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}
