//! Command-specific types.

pub mod build;
pub mod notify;
pub mod poll;
pub mod secrets;
pub mod status;

pub use build::{CancelBuildAck, CancelBuildArgs, ScheduleBuildAck, ScheduleBuildArgs};
pub use notify::{SendEmailArgs, StatusUpdate};
pub use poll::{BranchConf, PollRepoArgs};
pub use secrets::{AddOrUpdateSecretArgs, GetSecretsArgs, RemoveAllSecretsArgs, RemoveSecretArgs, SecretEntry};
pub use status::{HealthcheckReply, LeaderStatusReply};

/// Commands accepted by the master.
pub mod names {
    pub const AUTHENTICATE: &str = "authenticate";
    pub const HEALTHCHECK: &str = "healthcheck";
    pub const LEADER_STATUS: &str = "leader-status";
    pub const SCHEDULE_BUILD: &str = "schedule-build";
    pub const CANCEL_BUILD: &str = "cancel-build";
    pub const POLL_REPO: &str = "poll-repo";
    pub const ADD_OR_UPDATE_SECRET: &str = "add-or-update-secret";
    pub const REMOVE_SECRET: &str = "remove-secret";
    pub const GET_SECRETS: &str = "get-secrets";
    pub const REMOVE_ALL_SECRETS: &str = "remove-all-secrets";
    pub const SEND_EMAIL: &str = "send-email";
}

/// Actions the master sends to the poller and secrets services.
pub mod actions {
    pub const POLL: &str = "poll";
    pub const ADD_OR_UPDATE_SECRET: &str = "add-or-update-secret";
    pub const REMOVE_SECRET: &str = "remove-secret";
    pub const GET_SECRETS: &str = "get-secrets";
    pub const REMOVE_ALL: &str = "remove-all";
}
