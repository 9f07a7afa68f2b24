//! Poller command types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Per-branch polling configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BranchConf {
    /// Only notify the latest revision of a push, not every commit.
    #[serde(default)]
    pub notify_only_latest: bool,
    /// Branch whose builders are used when this one has no config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builders_fallback: Option<String>,
}

/// Arguments for `poll-repo`, forwarded as the body of the poller `poll`
/// action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollRepoArgs {
    pub repo_id: String,
    /// Clone URL of the repository.
    pub url: String,
    /// Version control system (e.g. "git").
    #[serde(default = "default_vcs_type")]
    pub vcs_type: String,
    /// Branches the master already knows about.
    #[serde(default)]
    pub known_branches: Vec<String>,
    /// Latest known commit date per branch.
    #[serde(default)]
    pub since: BTreeMap<String, String>,
    /// Branch configuration keyed by branch name.
    #[serde(default)]
    pub branches_conf: BTreeMap<String, BranchConf>,
    /// External (pull request) source information.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<serde_json::Value>,
    /// Build config filename inside the repository.
    #[serde(default = "default_conffile")]
    pub conffile: String,
}

fn default_vcs_type() -> String {
    "git".to_string()
}

fn default_conffile() -> String {
    "toxicbuild.yml".to_string()
}
