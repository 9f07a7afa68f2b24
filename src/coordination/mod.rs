//! Coordination Client
//!
//! Leader election over a hierarchical, session-based coordination service
//! with ephemeral sequential nodes. The backend is pluggable:
//!
//! - [`ZooKeeperCoordination`] for deployments
//! - [`InMemoryCoordination`] for tests
//!
//! [`CoordinationClient`] owns the election and is the only writer of the
//! process role; everything else reads it through [`RoleHandle`].

pub mod election;
pub mod memory;
pub mod role;
pub mod zookeeper;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

pub use election::{CoordinationClient, ElectionConfig, LeadershipListener, PendingElection};
pub use memory::InMemoryCoordination;
pub use role::{Membership, Role, RoleHandle};
pub use zookeeper::ZooKeeperCoordination;

/// Backend session identifier.
pub type SessionId = u64;

/// Coordination errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinationError {
    #[error("coordination session {0} expired")]
    SessionExpired(SessionId),

    #[error("node {0} does not exist")]
    NoNode(String),

    #[error("node {0} already exists")]
    NodeExists(String),

    #[error("node {0} changed concurrently")]
    BadVersion(String),

    #[error("node {path} holds unexpected data: {reason}")]
    InvalidData { path: String, reason: String },

    #[error("coordination backend unavailable: {0}")]
    Unavailable(String),

    #[error("coordination {operation} timed out after {after_ms}ms")]
    Timeout { operation: &'static str, after_ms: u64 },
}

/// Events the backend delivers to a session owner.
#[derive(Debug)]
pub enum SessionEvent {
    /// The session is gone. Its ephemeral nodes are reaped once the owner
    /// acknowledges (or the backend's grace period runs out).
    Expired(ExpiryAck),
}

/// Acknowledgement for a session expiry. Dropping it also acknowledges.
#[derive(Debug)]
pub struct ExpiryAck(oneshot::Sender<()>);

impl ExpiryAck {
    pub fn new(tx: oneshot::Sender<()>) -> Self {
        Self(tx)
    }

    pub fn ack(self) {
        let _ = self.0.send(());
    }
}

/// An open backend session.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub events: mpsc::Receiver<SessionEvent>,
}

/// One-shot notification that a node was removed.
#[derive(Debug)]
pub struct NodeWatch(oneshot::Receiver<()>);

impl NodeWatch {
    pub fn new(rx: oneshot::Receiver<()>) -> Self {
        Self(rx)
    }

    /// Resolves when the node is removed or the backend drops the watch.
    pub async fn removed(self) {
        let _ = self.0.await;
    }
}

/// Hierarchical coordination service with ephemeral sequential nodes.
#[async_trait]
pub trait CoordinationBackend: Send + Sync + 'static {
    /// Open a session that expires after `session_timeout` without pings.
    async fn connect(&self, session_timeout: Duration) -> Result<Session, CoordinationError>;

    /// Create `<parent>/<prefix><seq>` owned by `session`, returning its path.
    async fn create_ephemeral_sequential(
        &self,
        session: SessionId,
        parent: &str,
        prefix: &str,
        data: &[u8],
    ) -> Result<String, CoordinationError>;

    /// Names (not paths) of the direct children of `parent`.
    async fn children(&self, parent: &str) -> Result<Vec<String>, CoordinationError>;

    /// Watch `path` for removal. Fails with `NoNode` if it is already gone.
    async fn watch_removal(&self, path: &str) -> Result<NodeWatch, CoordinationError>;

    /// Keep `session` alive.
    async fn ping(&self, session: SessionId) -> Result<(), CoordinationError>;

    /// Delete a node owned by `session`.
    async fn delete(&self, session: SessionId, path: &str) -> Result<(), CoordinationError>;

    /// Close `session`, removing its ephemeral nodes.
    async fn close(&self, session: SessionId) -> Result<(), CoordinationError>;

    /// Data and version of a persistent node. Fails with `NoNode` if absent.
    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, i32), CoordinationError>;

    /// Create a persistent node and any missing parents. Fails with
    /// `NodeExists` if it is already there.
    async fn create_persistent(&self, path: &str, data: &[u8]) -> Result<(), CoordinationError>;

    /// Replace the data of `path` if its version is still `version`,
    /// returning the new version. Fails with `BadVersion` otherwise.
    async fn set_data(&self, path: &str, data: &[u8], version: i32) -> Result<i32, CoordinationError>;
}
