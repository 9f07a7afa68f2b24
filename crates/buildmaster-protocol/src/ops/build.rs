//! Build scheduling command types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Arguments for `schedule-build`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleBuildArgs {
    /// Repository the buildset belongs to.
    pub repo_id: String,
    /// Branch of the revision to build.
    pub branch: String,
    /// Commit or tag to build.
    pub named_tree: String,
    /// Builders to run. Empty means every builder from the build config.
    #[serde(default)]
    pub builders: Vec<String>,
    /// Branch whose builder config is used when this branch has none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builders_from: Option<String>,
    /// Information about an external (pull request) revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<serde_json::Value>,
}

/// Scheduling acknowledgement returned by the leader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleBuildAck {
    /// Identifier of the new buildset.
    pub buildset_id: String,
    /// Repository the buildset belongs to.
    pub repo_id: String,
    /// Per-repository buildset number.
    pub number: u64,
    /// Branch of the revision.
    pub branch: String,
    /// Commit or tag.
    pub named_tree: String,
    /// Builders requested.
    pub builders: Vec<String>,
    /// Initial buildset status.
    pub status: String,
    /// When the buildset was created.
    pub created: DateTime<Utc>,
}

/// Arguments for `cancel-build`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelBuildArgs {
    /// Repository that owns the build.
    pub repo_id: String,
    /// Build to cancel.
    pub build_uuid: String,
}

/// Reply to `cancel-build`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelBuildAck {
    pub build_uuid: String,
    pub cancelled: bool,
}
