//! Process role and its read-only accessor.

use std::fmt;

use serde::Serialize;
use tokio::sync::watch;

/// Election role of this master instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Not registered, or registration lost.
    Unknown,
    Follower,
    Leader,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Unknown => "unknown",
            Role::Follower => "follower",
            Role::Leader => "leader",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role together with the election node backing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub role: Role,
    pub node: Option<String>,
}

impl Membership {
    pub fn unknown() -> Self {
        Self {
            role: Role::Unknown,
            node: None,
        }
    }
}

/// Read-only view of the current role.
#[derive(Debug, Clone)]
pub struct RoleHandle {
    rx: watch::Receiver<Membership>,
}

impl RoleHandle {
    /// A handle pinned to `role`, for components run without an election.
    pub fn fixed(role: Role) -> Self {
        let (_tx, rx) = watch::channel(Membership { role, node: None });
        Self { rx }
    }

    pub fn current(&self) -> Role {
        self.rx.borrow().role
    }

    pub fn membership(&self) -> Membership {
        self.rx.borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.current() == Role::Leader
    }

    /// Wait until the role equals `role`. Returns false if the writer is gone
    /// and the role can no longer change.
    pub async fn wait_for(&self, role: Role) -> bool {
        let mut rx = self.rx.clone();
        let reached = rx.wait_for(|m| m.role == role).await.is_ok();
        reached
    }

    pub fn subscribe(&self) -> watch::Receiver<Membership> {
        self.rx.clone()
    }
}

/// Write side, held only by the election driver.
#[derive(Debug)]
pub(crate) struct RoleWriter {
    tx: watch::Sender<Membership>,
}

impl RoleWriter {
    pub(crate) fn new() -> (Self, RoleHandle) {
        let (tx, rx) = watch::channel(Membership::unknown());
        (Self { tx }, RoleHandle { rx })
    }

    pub(crate) fn current(&self) -> Role {
        self.tx.borrow().role
    }

    /// Publish a new membership, returning the previous role.
    pub(crate) fn set(&self, role: Role, node: Option<String>) -> Role {
        let next = Membership { role, node };
        let previous = self.tx.send_replace(next.clone());
        if previous != next {
            tracing::info!(from = %previous.role, to = %role, node = ?next.node, "role changed");
        }
        previous.role
    }
}
