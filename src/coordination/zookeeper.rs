//! ZooKeeper coordination backend.
//!
//! Each election session is its own ZooKeeper client, so closing or losing
//! one reaps exactly the ephemeral nodes it created. Reads, watches and
//! persistent counters go through a shared client that reconnects after
//! its session expires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use zookeeper_client as zk;

use super::{
    CoordinationBackend, CoordinationError, ExpiryAck, NodeWatch, Session, SessionEvent, SessionId,
};
use crate::config::CoordinationConfig;

const SESSION_EVENT_BUFFER: usize = 8;

/// Coordination over a ZooKeeper ensemble.
pub struct ZooKeeperCoordination {
    connect_string: String,
    shared_timeout: Duration,
    next_session: AtomicU64,
    sessions: Mutex<HashMap<SessionId, zk::Client>>,
    shared: tokio::sync::Mutex<Option<zk::Client>>,
}

impl ZooKeeperCoordination {
    /// Backend for `connect_string` (`host:port,host:port[/chroot]`). No
    /// connection is made until the first call.
    pub fn new(connect_string: impl Into<String>, shared_timeout: Duration) -> Self {
        Self {
            connect_string: connect_string.into(),
            shared_timeout,
            next_session: AtomicU64::new(0),
            sessions: Mutex::new(HashMap::new()),
            shared: tokio::sync::Mutex::new(None),
        }
    }

    pub fn from_config(config: &CoordinationConfig) -> Self {
        Self::new(config.connect_string(), config.session_timeout())
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<SessionId, zk::Client>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn open(&self, session_timeout: Duration) -> Result<zk::Client, CoordinationError> {
        zk::Client::connector()
            .session_timeout(session_timeout)
            .connect(&self.connect_string)
            .await
            .map_err(|e| {
                CoordinationError::Unavailable(format!("connect to {}: {}", self.connect_string, e))
            })
    }

    fn session_client(&self, session: SessionId) -> Result<zk::Client, CoordinationError> {
        self.lock_sessions()
            .get(&session)
            .cloned()
            .ok_or(CoordinationError::SessionExpired(session))
    }

    async fn shared(&self) -> Result<zk::Client, CoordinationError> {
        let mut shared = self.shared.lock().await;
        if let Some(client) = shared.as_ref() {
            return Ok(client.clone());
        }
        let client = self.open(self.shared_timeout).await?;
        *shared = Some(client.clone());
        Ok(client)
    }

    /// Map a shared-client result, dropping the client if its session is gone.
    async fn shared_result<T>(&self, path: &str, result: Result<T, zk::Error>) -> Result<T, CoordinationError> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                if matches!(err, zk::Error::SessionExpired | zk::Error::ClientClosed) {
                    tracing::debug!(error = %err, "dropping shared coordination client");
                    *self.shared.lock().await = None;
                }
                Err(map_error(path, err))
            }
        }
    }
}

impl std::fmt::Debug for ZooKeeperCoordination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZooKeeperCoordination")
            .field("connect_string", &self.connect_string)
            .field("sessions", &self.lock_sessions().len())
            .finish()
    }
}

fn map_error(path: &str, err: zk::Error) -> CoordinationError {
    match err {
        zk::Error::NoNode => CoordinationError::NoNode(path.to_string()),
        zk::Error::NodeExists => CoordinationError::NodeExists(path.to_string()),
        zk::Error::BadVersion => CoordinationError::BadVersion(path.to_string()),
        other => CoordinationError::Unavailable(format!("{}: {}", path, other)),
    }
}

fn session_error(session: SessionId, path: &str, err: zk::Error) -> CoordinationError {
    match err {
        zk::Error::SessionExpired | zk::Error::ClientClosed => CoordinationError::SessionExpired(session),
        other => map_error(path, other),
    }
}

/// `/a/b/c` yields `/a`, `/a/b`, `/a/b/c`.
fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for part in path.split('/').filter(|part| !part.is_empty()) {
        current.push('/');
        current.push_str(part);
        out.push(current.clone());
    }
    out
}

fn parent_of(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) | None => "/",
        Some(index) => &path[..index],
    }
}

/// Create `path` and its missing parents as empty persistent nodes.
async fn ensure_path(client: &zk::Client, path: &str) -> Result<(), zk::Error> {
    let options = zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all());
    for prefix in ancestors(path) {
        match client.create(&prefix, &[], &options).await {
            Ok(_) | Err(zk::Error::NodeExists) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Forward terminal session states to the session owner.
async fn watch_session(id: SessionId, mut watcher: zk::StateWatcher, events: mpsc::Sender<SessionEvent>) {
    loop {
        match watcher.changed().await {
            zk::SessionState::Expired | zk::SessionState::AuthFailed => {
                tracing::warn!(session = id, "coordination session expired");
                // The ensemble reaps ephemeral nodes on its own schedule.
                let (ack, _) = oneshot::channel();
                let _ = events.send(SessionEvent::Expired(ExpiryAck::new(ack))).await;
                return;
            }
            zk::SessionState::Closed => return,
            state => tracing::debug!(session = id, ?state, "coordination session state"),
        }
    }
}

#[async_trait]
impl CoordinationBackend for ZooKeeperCoordination {
    async fn connect(&self, session_timeout: Duration) -> Result<Session, CoordinationError> {
        let client = self.open(session_timeout).await?;
        let id = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(SESSION_EVENT_BUFFER);
        tokio::spawn(watch_session(id, client.state_watcher(), tx));
        self.lock_sessions().insert(id, client);
        tracing::debug!(session = id, hosts = %self.connect_string, "coordination session opened");
        Ok(Session { id, events: rx })
    }

    async fn create_ephemeral_sequential(
        &self,
        session: SessionId,
        parent: &str,
        prefix: &str,
        data: &[u8],
    ) -> Result<String, CoordinationError> {
        let client = self.session_client(session)?;
        ensure_path(&client, parent)
            .await
            .map_err(|e| session_error(session, parent, e))?;

        let base = format!("{}/{}", parent.trim_end_matches('/'), prefix);
        let options = zk::CreateMode::EphemeralSequential.with_acls(zk::Acls::anyone_all());
        let (_, sequence) = client
            .create(&base, data, &options)
            .await
            .map_err(|e| session_error(session, &base, e))?;
        Ok(format!("{}{}", base, sequence))
    }

    async fn children(&self, parent: &str) -> Result<Vec<String>, CoordinationError> {
        let client = self.shared().await?;
        let result = client.list_children(parent).await;
        self.shared_result(parent, result).await
    }

    async fn watch_removal(&self, path: &str) -> Result<NodeWatch, CoordinationError> {
        let client = self.shared().await?;
        let result = client.check_and_watch_stat(path).await;
        let (stat, watcher) = self.shared_result(path, result).await?;
        if stat.is_none() {
            return Err(CoordinationError::NoNode(path.to_string()));
        }

        let (mut tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            // Any event on the watch, including session loss, ends it.
            let fired = tokio::select! {
                _ = watcher.changed() => true,
                _ = tx.closed() => false,
            };
            if fired {
                let _ = tx.send(());
            }
        });
        Ok(NodeWatch::new(rx))
    }

    async fn ping(&self, session: SessionId) -> Result<(), CoordinationError> {
        let client = self.session_client(session)?;
        client
            .check_stat("/")
            .await
            .map(|_| ())
            .map_err(|e| session_error(session, "/", e))
    }

    async fn delete(&self, session: SessionId, path: &str) -> Result<(), CoordinationError> {
        let client = self.session_client(session)?;
        client
            .delete(path, None)
            .await
            .map_err(|e| session_error(session, path, e))
    }

    async fn close(&self, session: SessionId) -> Result<(), CoordinationError> {
        // Dropping the last handle closes the session and its ephemeral nodes.
        match self.lock_sessions().remove(&session) {
            Some(client) => {
                drop(client);
                tracing::debug!(session, "coordination session closed");
                Ok(())
            }
            None => Err(CoordinationError::SessionExpired(session)),
        }
    }

    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, i32), CoordinationError> {
        let client = self.shared().await?;
        let result = client.get_data(path).await;
        let (data, stat) = self.shared_result(path, result).await?;
        Ok((data, stat.version))
    }

    async fn create_persistent(&self, path: &str, data: &[u8]) -> Result<(), CoordinationError> {
        let client = self.shared().await?;
        let parent = parent_of(path);
        if parent != "/" {
            let result = ensure_path(&client, parent).await;
            self.shared_result(parent, result).await?;
        }
        let options = zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all());
        let result = client.create(path, data, &options).await;
        self.shared_result(path, result).await.map(|_| ())
    }

    async fn set_data(&self, path: &str, data: &[u8], version: i32) -> Result<i32, CoordinationError> {
        let client = self.shared().await?;
        let result = client.set_data(path, data, Some(version)).await;
        let stat = self.shared_result(path, result).await?;
        Ok(stat.version)
    }
}
