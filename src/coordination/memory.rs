//! In-process coordination backend.
//!
//! Implements ephemeral sequential nodes, versioned persistent nodes,
//! removal watches and session expiry for a single process. Several masters
//! in one test share an instance to model a shared ensemble.
//!
//! ## Limitations
//!
//! - No cross-process coordination
//! - No persistence
//! - Sessions only expire through [`InMemoryCoordination::expire_session`]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::{
    CoordinationBackend, CoordinationError, ExpiryAck, NodeWatch, Session, SessionEvent, SessionId,
};

const SESSION_EVENT_BUFFER: usize = 8;

#[derive(Debug)]
struct Node {
    owner: SessionId,
    data: Vec<u8>,
}

#[derive(Debug)]
struct DataNode {
    data: Vec<u8>,
    version: i32,
}

#[derive(Debug, Default)]
struct State {
    next_session: SessionId,
    sequences: HashMap<String, u64>,
    nodes: BTreeMap<String, Node>,
    persistent: BTreeMap<String, DataNode>,
    sessions: HashMap<SessionId, mpsc::Sender<SessionEvent>>,
    watches: HashMap<String, Vec<oneshot::Sender<()>>>,
    unavailable: bool,
}

impl State {
    fn check_available(&self) -> Result<(), CoordinationError> {
        if self.unavailable {
            return Err(CoordinationError::Unavailable("backend marked unavailable".to_string()));
        }
        Ok(())
    }

    fn check_session(&self, session: SessionId) -> Result<(), CoordinationError> {
        self.check_available()?;
        if !self.sessions.contains_key(&session) {
            return Err(CoordinationError::SessionExpired(session));
        }
        Ok(())
    }

    /// Remove a node and collect the watches to fire.
    fn remove_node(&mut self, path: &str, fired: &mut Vec<oneshot::Sender<()>>) {
        if self.nodes.remove(path).is_some() {
            if let Some(watchers) = self.watches.remove(path) {
                fired.extend(watchers);
            }
        }
    }

    fn reap(&mut self, session: SessionId) -> Vec<oneshot::Sender<()>> {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == session)
            .map(|(path, _)| path.clone())
            .collect();
        let mut fired = Vec::new();
        for path in owned {
            self.remove_node(&path, &mut fired);
        }
        fired
    }
}

/// In-memory coordination backend.
#[derive(Debug)]
pub struct InMemoryCoordination {
    state: Mutex<State>,
    expiry_grace: Duration,
}

impl Default for InMemoryCoordination {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

fn fire(watchers: Vec<oneshot::Sender<()>>) {
    for watcher in watchers {
        let _ = watcher.send(());
    }
}

impl InMemoryCoordination {
    /// `expiry_grace` bounds how long an expiry waits for the owner's ack.
    pub fn new(expiry_grace: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                next_session: 1,
                ..State::default()
            }),
            expiry_grace,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Expire a session the way a coordination service does after missed
    /// heartbeats.
    ///
    /// The owner receives [`SessionEvent::Expired`] first. Its ephemeral
    /// nodes are removed (and removal watches fired) only after it
    /// acknowledges or the grace period elapses, so the owner observes its
    /// own demotion before any successor can observe the vacancy.
    pub async fn expire_session(&self, session: SessionId) -> bool {
        let events = self.lock().sessions.remove(&session);
        let Some(events) = events else {
            return false;
        };

        let (tx, rx) = oneshot::channel();
        if events.send(SessionEvent::Expired(ExpiryAck::new(tx))).await.is_ok() {
            let _ = tokio::time::timeout(self.expiry_grace, rx).await;
        }

        let fired = self.lock().reap(session);
        tracing::debug!(session, reaped = fired.len(), "coordination session expired");
        fire(fired);
        true
    }

    /// Make every operation fail with `Unavailable` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Owning session of `path`, if it exists.
    pub fn owner_of(&self, path: &str) -> Option<SessionId> {
        self.lock().nodes.get(path).map(|node| node.owner)
    }

    /// Payload stored in `path`, if it exists.
    pub fn data_of(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().nodes.get(path).map(|node| node.data.clone())
    }

    /// Sessions currently open.
    pub fn live_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.lock().sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[async_trait]
impl CoordinationBackend for InMemoryCoordination {
    async fn connect(&self, _session_timeout: Duration) -> Result<Session, CoordinationError> {
        let mut state = self.lock();
        state.check_available()?;

        let id = state.next_session;
        state.next_session += 1;
        let (tx, rx) = mpsc::channel(SESSION_EVENT_BUFFER);
        state.sessions.insert(id, tx);
        Ok(Session { id, events: rx })
    }

    async fn create_ephemeral_sequential(
        &self,
        session: SessionId,
        parent: &str,
        prefix: &str,
        data: &[u8],
    ) -> Result<String, CoordinationError> {
        let mut state = self.lock();
        state.check_session(session)?;

        let parent = parent.trim_end_matches('/');
        let seq = state.sequences.entry(parent.to_string()).or_insert(0);
        let path = format!("{}/{}{:010}", parent, prefix, *seq);
        *seq += 1;

        state.nodes.insert(
            path.clone(),
            Node {
                owner: session,
                data: data.to_vec(),
            },
        );
        Ok(path)
    }

    async fn children(&self, parent: &str) -> Result<Vec<String>, CoordinationError> {
        let state = self.lock();
        state.check_available()?;

        let prefix = format!("{}/", parent.trim_end_matches('/'));
        Ok(state
            .nodes
            .keys()
            .chain(state.persistent.keys())
            .filter_map(|path| path.strip_prefix(&prefix))
            .filter(|name| !name.contains('/'))
            .map(str::to_string)
            .collect())
    }

    async fn watch_removal(&self, path: &str) -> Result<NodeWatch, CoordinationError> {
        let mut state = self.lock();
        state.check_available()?;

        if !state.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        state.watches.entry(path.to_string()).or_default().push(tx);
        Ok(NodeWatch::new(rx))
    }

    async fn ping(&self, session: SessionId) -> Result<(), CoordinationError> {
        self.lock().check_session(session)
    }

    async fn delete(&self, session: SessionId, path: &str) -> Result<(), CoordinationError> {
        let fired = {
            let mut state = self.lock();
            state.check_session(session)?;
            match state.nodes.get(path) {
                None => return Err(CoordinationError::NoNode(path.to_string())),
                Some(node) if node.owner != session => {
                    return Err(CoordinationError::NoNode(path.to_string()))
                }
                Some(_) => {}
            }
            let mut fired = Vec::new();
            state.remove_node(path, &mut fired);
            fired
        };
        fire(fired);
        Ok(())
    }

    async fn close(&self, session: SessionId) -> Result<(), CoordinationError> {
        let fired = {
            let mut state = self.lock();
            if state.sessions.remove(&session).is_none() {
                return Err(CoordinationError::SessionExpired(session));
            }
            state.reap(session)
        };
        fire(fired);
        Ok(())
    }

    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, i32), CoordinationError> {
        let state = self.lock();
        state.check_available()?;
        state
            .persistent
            .get(path)
            .map(|node| (node.data.clone(), node.version))
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))
    }

    async fn create_persistent(&self, path: &str, data: &[u8]) -> Result<(), CoordinationError> {
        let mut state = self.lock();
        state.check_available()?;
        if state.persistent.contains_key(path) || state.nodes.contains_key(path) {
            return Err(CoordinationError::NodeExists(path.to_string()));
        }
        state.persistent.insert(
            path.to_string(),
            DataNode {
                data: data.to_vec(),
                version: 0,
            },
        );
        Ok(())
    }

    async fn set_data(&self, path: &str, data: &[u8], version: i32) -> Result<i32, CoordinationError> {
        let mut state = self.lock();
        state.check_available()?;
        let node = state
            .persistent
            .get_mut(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))?;
        if node.version != version {
            return Err(CoordinationError::BadVersion(path.to_string()));
        }
        node.data = data.to_vec();
        node.version += 1;
        Ok(node.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_sequential_nodes_are_ordered() {
        let backend = InMemoryCoordination::default();
        let s = backend.connect(TIMEOUT).await.unwrap();

        let a = backend.create_ephemeral_sequential(s.id, "/election", "member-", b"a").await.unwrap();
        let b = backend.create_ephemeral_sequential(s.id, "/election", "member-", b"b").await.unwrap();

        assert_eq!(a, "/election/member-0000000000");
        assert_eq!(b, "/election/member-0000000001");
        assert_eq!(
            backend.children("/election").await.unwrap(),
            vec!["member-0000000000", "member-0000000001"]
        );
    }

    #[tokio::test]
    async fn test_watch_missing_node() {
        let backend = InMemoryCoordination::default();
        let err = backend.watch_removal("/election/member-0000000009").await.unwrap_err();
        assert!(matches!(err, CoordinationError::NoNode(_)));
    }

    #[tokio::test]
    async fn test_close_reaps_and_fires_watch() {
        let backend = InMemoryCoordination::default();
        let s = backend.connect(TIMEOUT).await.unwrap();
        let path = backend.create_ephemeral_sequential(s.id, "/e", "member-", b"").await.unwrap();
        let watch = backend.watch_removal(&path).await.unwrap();

        backend.close(s.id).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), watch.removed()).await.unwrap();
        assert!(backend.children("/e").await.unwrap().is_empty());
        assert!(matches!(backend.ping(s.id).await, Err(CoordinationError::SessionExpired(_))));
    }

    #[tokio::test]
    async fn test_delete_requires_ownership() {
        let backend = InMemoryCoordination::default();
        let owner = backend.connect(TIMEOUT).await.unwrap();
        let other = backend.connect(TIMEOUT).await.unwrap();
        let path = backend.create_ephemeral_sequential(owner.id, "/e", "member-", b"").await.unwrap();

        assert!(backend.delete(other.id, &path).await.is_err());
        backend.delete(owner.id, &path).await.unwrap();
        assert_eq!(backend.owner_of(&path), None);
    }

    #[tokio::test]
    async fn test_expiry_waits_for_ack_before_reaping() {
        let backend = std::sync::Arc::new(InMemoryCoordination::new(Duration::from_secs(5)));
        let mut session = backend.connect(TIMEOUT).await.unwrap();
        let path = backend
            .create_ephemeral_sequential(session.id, "/e", "member-", b"")
            .await
            .unwrap();

        let expiring = {
            let backend = backend.clone();
            let id = session.id;
            tokio::spawn(async move { backend.expire_session(id).await })
        };

        let SessionEvent::Expired(ack) = session.events.recv().await.unwrap();
        // Not reaped until acknowledged.
        assert_eq!(backend.owner_of(&path), Some(session.id));
        ack.ack();

        assert!(expiring.await.unwrap());
        assert_eq!(backend.owner_of(&path), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_grace_elapses_without_ack() {
        let backend = InMemoryCoordination::new(Duration::from_millis(100));
        let session = backend.connect(TIMEOUT).await.unwrap();
        let path = backend
            .create_ephemeral_sequential(session.id, "/e", "member-", b"")
            .await
            .unwrap();

        // Keep the receiver alive but never read it.
        let _events = session.events;
        assert!(backend.expire_session(session.id).await);
        assert_eq!(backend.owner_of(&path), None);
        assert!(!backend.expire_session(session.id).await);
    }

    #[tokio::test]
    async fn test_persistent_node_versions() {
        let backend = InMemoryCoordination::default();
        backend.create_persistent("/counters/repo-1", b"1").await.unwrap();
        assert!(matches!(
            backend.create_persistent("/counters/repo-1", b"9").await,
            Err(CoordinationError::NodeExists(_))
        ));

        let (data, version) = backend.get_data("/counters/repo-1").await.unwrap();
        assert_eq!((data.as_slice(), version), (&b"1"[..], 0));

        assert_eq!(backend.set_data("/counters/repo-1", b"2", 0).await.unwrap(), 1);
        assert!(matches!(
            backend.set_data("/counters/repo-1", b"3", 0).await,
            Err(CoordinationError::BadVersion(_))
        ));
        assert_eq!(backend.children("/counters").await.unwrap(), vec!["repo-1"]);
    }

    #[tokio::test]
    async fn test_persistent_node_survives_session_close() {
        let backend = InMemoryCoordination::default();
        let s = backend.connect(TIMEOUT).await.unwrap();
        backend.create_persistent("/counters/repo-1", b"4").await.unwrap();
        backend.close(s.id).await.unwrap();
        assert_eq!(backend.get_data("/counters/repo-1").await.unwrap().0, b"4".to_vec());
    }

    #[tokio::test]
    async fn test_unavailable_backend() {
        let backend = InMemoryCoordination::default();
        let s = backend.connect(TIMEOUT).await.unwrap();
        backend.set_unavailable(true);

        assert!(matches!(backend.ping(s.id).await, Err(CoordinationError::Unavailable(_))));
        assert!(backend.connect(TIMEOUT).await.is_err());

        backend.set_unavailable(false);
        assert!(backend.ping(s.id).await.is_ok());
    }
}
