//! Leader election driver.
//!
//! Each instance registers `member-<seq>` under the election path. The
//! lowest sequence leads; every other member watches only its immediate
//! predecessor, so a departure wakes exactly one follower.
//!
//! Losing the session (expiry, failed heartbeat, own node removed) demotes
//! the instance to [`Role::Unknown`], runs the demotion hooks, and
//! re-registers under exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::role::RoleWriter;
use super::{CoordinationBackend, CoordinationError, Role, RoleHandle, SessionEvent, SessionId};
use crate::config::MasterConfig;
use crate::retry::BackoffConfig;

/// Node name prefix for election members.
pub const MEMBER_PREFIX: &str = "member-";

/// Hooks run on leadership transitions.
#[async_trait]
pub trait LeadershipListener: Send + Sync {
    /// This instance just became leader.
    async fn on_elected(&self);

    /// This instance stopped being leader.
    async fn on_demoted(&self);
}

/// Election parameters
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    pub election_path: String,
    pub instance_id: String,
    pub session_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub ping_timeout: Duration,
    pub backoff: BackoffConfig,
}

impl ElectionConfig {
    pub fn new(election_path: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            election_path: election_path.into(),
            instance_id: instance_id.into(),
            session_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(1),
            ping_timeout: Duration::from_secs(3),
            backoff: BackoffConfig::default(),
        }
    }

    pub fn from_master(config: &MasterConfig) -> Self {
        Self {
            election_path: config.coordination.election_path.clone(),
            instance_id: config.instance_id.clone(),
            session_timeout: config.coordination.session_timeout(),
            heartbeat_interval: config.coordination.heartbeat_interval(),
            ping_timeout: config.timeouts.coordination_ping(),
            backoff: config.coordination.reregister_backoff,
        }
    }

    pub fn with_heartbeat(mut self, interval: Duration, ping_timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.ping_timeout = ping_timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Handle to a running election.
pub struct CoordinationClient {
    role: RoleHandle,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// An election that has not joined yet. Its role handle already exists,
/// reading `Unknown`, so components built before the listeners can hold it.
pub struct PendingElection {
    backend: Arc<dyn CoordinationBackend>,
    config: ElectionConfig,
    writer: RoleWriter,
    role: RoleHandle,
}

impl PendingElection {
    pub fn role(&self) -> RoleHandle {
        self.role.clone()
    }

    /// Start participating in the election.
    pub fn start(self, listeners: Vec<Arc<dyn LeadershipListener>>) -> CoordinationClient {
        let cancel = CancellationToken::new();
        let election = Election {
            backend: self.backend,
            config: self.config,
            listeners,
            role: self.writer,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(election.run());
        CoordinationClient {
            role: self.role,
            cancel,
            task,
        }
    }
}

impl CoordinationClient {
    pub fn prepare(backend: Arc<dyn CoordinationBackend>, config: ElectionConfig) -> PendingElection {
        let (writer, role) = RoleWriter::new();
        PendingElection {
            backend,
            config,
            writer,
            role,
        }
    }

    /// Start participating in the election.
    pub fn spawn(
        backend: Arc<dyn CoordinationBackend>,
        config: ElectionConfig,
        listeners: Vec<Arc<dyn LeadershipListener>>,
    ) -> Self {
        Self::prepare(backend, config).start(listeners)
    }

    /// Read-only role accessor.
    pub fn role(&self) -> RoleHandle {
        self.role.clone()
    }

    /// Leave the election: delete the node, close the session and end in
    /// `Unknown`.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "election task failed");
        }
    }
}

/// Why a registered session ended.
enum SessionEnd {
    Shutdown,
    Lost(CoordinationError),
}

struct Election {
    backend: Arc<dyn CoordinationBackend>,
    config: ElectionConfig,
    listeners: Vec<Arc<dyn LeadershipListener>>,
    role: RoleWriter,
    cancel: CancellationToken,
}

impl Election {
    async fn run(self) {
        let mut failures: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.participate(&mut failures).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost(err) => {
                    self.demote().await;
                    failures = failures.saturating_add(1);
                    let delay = self.config.backoff.delay(failures);
                    tracing::warn!(
                        error = %err,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "coordination session lost, re-registering"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        self.demote().await;
    }

    /// One session lifetime: connect, register, follow the election until
    /// the session is lost or shutdown is requested.
    ///
    /// The role is dropped before any backend cleanup, so an unreachable
    /// backend can never leave this instance claiming leadership.
    async fn participate(&self, failures: &mut u32) -> SessionEnd {
        let connect = self.backend.connect(self.config.session_timeout);
        let session = match self.bounded("connect", self.config.session_timeout, connect).await {
            Ok(session) => session,
            Err(e) => return SessionEnd::Lost(e),
        };
        let id = session.id;
        let mut events = session.events;

        let create = self.backend.create_ephemeral_sequential(
            id,
            &self.config.election_path,
            MEMBER_PREFIX,
            self.config.instance_id.as_bytes(),
        );
        let path = match self.bounded("register", self.config.ping_timeout, create).await {
            Ok(path) => path,
            Err(e) => {
                self.close_session(id).await;
                return SessionEnd::Lost(e);
            }
        };
        *failures = 0;
        tracing::info!(node = %path, session = id, "registered for election");

        let end = self.follow(id, &path, &mut events).await;
        self.demote().await;
        match &end {
            SessionEnd::Shutdown => {
                let delete = self.backend.delete(id, &path);
                if let Err(e) = self.bounded("delete", self.config.ping_timeout, delete).await {
                    tracing::debug!(error = %e, node = %path, "election node not deleted");
                }
                self.close_session(id).await;
                tracing::info!(node = %path, "left election");
            }
            SessionEnd::Lost(CoordinationError::SessionExpired(_)) => {}
            SessionEnd::Lost(_) => self.close_session(id).await,
        }
        end
    }

    async fn close_session(&self, id: SessionId) {
        let close = self.backend.close(id);
        if let Err(e) = self.bounded("close", self.config.ping_timeout, close).await {
            tracing::debug!(error = %e, session = id, "session not closed cleanly");
        }
    }

    /// Run a backend call under `limit`.
    async fn bounded<T>(
        &self,
        operation: &'static str,
        limit: Duration,
        call: impl std::future::Future<Output = Result<T, CoordinationError>>,
    ) -> Result<T, CoordinationError> {
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(CoordinationError::Timeout {
                operation,
                after_ms: limit.as_millis() as u64,
            }),
        }
    }

    async fn follow(
        &self,
        id: SessionId,
        path: &str,
        events: &mut mpsc::Receiver<SessionEvent>,
    ) -> SessionEnd {
        let own_name = path.rsplit('/').next().unwrap_or(path);

        loop {
            let listing = self.backend.children(&self.config.election_path);
            let members = match self.bounded("children", self.config.ping_timeout, listing).await {
                Ok(children) => sorted_members(children),
                Err(e) => return SessionEnd::Lost(e),
            };
            let Some(position) = members.iter().position(|(_, name)| name == own_name) else {
                return SessionEnd::Lost(CoordinationError::NoNode(path.to_string()));
            };

            let watched = if position == 0 {
                self.promote(path).await;
                path.to_string()
            } else {
                self.follow_as(path).await;
                format!(
                    "{}/{}",
                    self.config.election_path.trim_end_matches('/'),
                    members[position - 1].1
                )
            };

            let watch = match self
                .bounded("watch", self.config.ping_timeout, self.backend.watch_removal(&watched))
                .await
            {
                Ok(watch) => watch,
                // Predecessor left between listing and watching.
                Err(CoordinationError::NoNode(_)) if position > 0 => continue,
                Err(e) => return SessionEnd::Lost(e),
            };
            let removed = watch.removed();
            tokio::pin!(removed);

            let mut heartbeat = interval_at(
                Instant::now() + self.config.heartbeat_interval,
                self.config.heartbeat_interval,
            );
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return SessionEnd::Shutdown,
                    event = events.recv() => match event {
                        Some(SessionEvent::Expired(ack)) => {
                            self.demote().await;
                            ack.ack();
                            return SessionEnd::Lost(CoordinationError::SessionExpired(id));
                        }
                        None => {
                            return SessionEnd::Lost(CoordinationError::Unavailable(
                                "session event stream closed".to_string(),
                            ));
                        }
                    },
                    _ = &mut removed => {
                        if position == 0 {
                            return SessionEnd::Lost(CoordinationError::NoNode(path.to_string()));
                        }
                        tracing::debug!(predecessor = %watched, "predecessor left, re-evaluating");
                        break;
                    }
                    _ = heartbeat.tick() => {
                        if let Err(e) = self.heartbeat(id).await {
                            return SessionEnd::Lost(e);
                        }
                    }
                }
            }
        }
    }

    async fn heartbeat(&self, id: SessionId) -> Result<(), CoordinationError> {
        self.bounded("ping", self.config.ping_timeout, self.backend.ping(id)).await
    }

    async fn promote(&self, path: &str) {
        let previous = self.role.set(Role::Leader, Some(path.to_string()));
        if previous != Role::Leader {
            tracing::info!(node = %path, instance_id = %self.config.instance_id, "elected leader");
            for listener in &self.listeners {
                listener.on_elected().await;
            }
        }
    }

    async fn follow_as(&self, path: &str) {
        let previous = self.role.set(Role::Follower, Some(path.to_string()));
        if previous == Role::Leader {
            for listener in &self.listeners {
                listener.on_demoted().await;
            }
        }
    }

    async fn demote(&self) {
        if self.role.current() == Role::Unknown {
            return;
        }
        let previous = self.role.set(Role::Unknown, None);
        if previous == Role::Leader {
            tracing::warn!(instance_id = %self.config.instance_id, "leadership lost");
            for listener in &self.listeners {
                listener.on_demoted().await;
            }
        }
    }
}

/// Parse `member-<seq>` names and order them by sequence.
fn sorted_members(children: Vec<String>) -> Vec<(u64, String)> {
    let mut members: Vec<(u64, String)> = children
        .into_iter()
        .filter_map(|name| {
            let seq = name.strip_prefix(MEMBER_PREFIX)?.parse::<u64>().ok()?;
            Some((seq, name))
        })
        .collect();
    members.sort();
    members
}
