//! Buildset scheduling.
//!
//! The leader numbers buildsets per repository, announces them on the bus
//! and posts a status notification. Both the `schedule-build` command and
//! inbound build requests from the broker go through [`Scheduler`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use buildmaster_protocol::ops::{CancelBuildAck, CancelBuildArgs, ScheduleBuildAck, ScheduleBuildArgs, StatusUpdate};
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::bus::{BusError, DeliveryHandler, Event, HandlerError, LifecycleEvent, MessageBus};
use crate::coordination::{CoordinationBackend, CoordinationError, InMemoryCoordination, RoleHandle};
use crate::notify::NotificationDispatcher;

/// Status of a freshly scheduled buildset.
pub const PENDING: &str = "pending";

/// Compare-and-set rounds before giving up on a contended counter.
const MAX_INCREMENT_ATTEMPTS: u32 = 16;

/// Scheduling errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("buildset numbering failed: {0}")]
    Numbering(#[from] CoordinationError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Per-repository buildset counters.
///
/// Each repository has a persistent node under `root` holding the last
/// number as decimal text, so a new leader continues where the old one
/// stopped. Numbers start at 1 and are never reused, even when announcing
/// the buildset fails.
pub struct BuildsetNumbers {
    backend: Arc<dyn CoordinationBackend>,
    root: String,
    call_timeout: Duration,
}

impl BuildsetNumbers {
    pub fn new(backend: Arc<dyn CoordinationBackend>, root: impl Into<String>, call_timeout: Duration) -> Self {
        Self {
            backend,
            root: root.into().trim_end_matches('/').to_string(),
            call_timeout,
        }
    }

    /// Counters private to this process.
    pub fn local() -> Self {
        Self::new(
            Arc::new(InMemoryCoordination::default()),
            "/buildsets",
            Duration::from_secs(5),
        )
    }

    fn path(&self, repo_id: &str) -> String {
        format!("{}/repo-{}", self.root, encode_node_name(repo_id))
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, CoordinationError>>,
    ) -> Result<T, CoordinationError> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CoordinationError::Timeout {
                operation,
                after_ms: self.call_timeout.as_millis() as u64,
            }),
        }
    }

    /// Next number for `repo_id`.
    pub async fn next(&self, repo_id: &str) -> Result<u64, CoordinationError> {
        let path = self.path(repo_id);
        for _ in 0..MAX_INCREMENT_ATTEMPTS {
            match self.call("get_data", self.backend.get_data(&path)).await {
                Ok((data, version)) => {
                    let number = parse_counter(&path, &data)? + 1;
                    let written = self
                        .call("set_data", self.backend.set_data(&path, number.to_string().as_bytes(), version))
                        .await;
                    match written {
                        Ok(_) => return Ok(number),
                        Err(CoordinationError::BadVersion(_)) | Err(CoordinationError::NoNode(_)) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Err(CoordinationError::NoNode(_)) => {
                    match self.call("create", self.backend.create_persistent(&path, b"1")).await {
                        Ok(()) => return Ok(1),
                        Err(CoordinationError::NodeExists(_)) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
        tracing::warn!(repo_id, path = %path, "buildset counter stayed contended");
        Err(CoordinationError::BadVersion(path))
    }

    /// Last number handed out for `repo_id`, if any.
    pub async fn last(&self, repo_id: &str) -> Result<Option<u64>, CoordinationError> {
        let path = self.path(repo_id);
        match self.call("get_data", self.backend.get_data(&path)).await {
            Ok((data, _)) => parse_counter(&path, &data).map(Some),
            Err(CoordinationError::NoNode(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for BuildsetNumbers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildsetNumbers").field("root", &self.root).finish()
    }
}

fn parse_counter(path: &str, data: &[u8]) -> Result<u64, CoordinationError> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.trim().parse().ok())
        .ok_or_else(|| CoordinationError::InvalidData {
            path: path.to_string(),
            reason: format!("expected a decimal counter, got {:?}", String::from_utf8_lossy(data)),
        })
}

/// Escape a repository id into a single node name.
fn encode_node_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Schedules and cancels builds on behalf of the leader.
pub struct Scheduler {
    numbers: BuildsetNumbers,
    bus: Arc<MessageBus>,
    notifier: NotificationDispatcher,
}

impl Scheduler {
    /// A scheduler with process-local counters. Deployments replace them
    /// with [`Scheduler::with_numbers`].
    pub fn new(bus: Arc<MessageBus>, notifier: NotificationDispatcher) -> Self {
        Self {
            numbers: BuildsetNumbers::local(),
            bus,
            notifier,
        }
    }

    pub fn with_numbers(mut self, numbers: BuildsetNumbers) -> Self {
        self.numbers = numbers;
        self
    }

    pub fn numbers(&self) -> &BuildsetNumbers {
        &self.numbers
    }

    /// Create a buildset and announce it. A broker failure fails the call.
    pub async fn schedule(&self, args: &ScheduleBuildArgs) -> Result<ScheduleBuildAck, ScheduleError> {
        let number = self.numbers.next(&args.repo_id).await?;
        let ack = ScheduleBuildAck {
            buildset_id: Uuid::new_v4().to_string(),
            repo_id: args.repo_id.clone(),
            number,
            branch: args.branch.clone(),
            named_tree: args.named_tree.clone(),
            builders: args.builders.clone(),
            status: PENDING.to_string(),
            created: Utc::now(),
        };

        let mut body = json!({
            "buildset_id": ack.buildset_id,
            "number": ack.number,
            "branch": ack.branch,
            "named_tree": ack.named_tree,
            "builders": ack.builders,
            "status": ack.status,
        });
        if let Some(from) = &args.builders_from {
            body["builders_from"] = json!(from);
        }
        if let Some(external) = &args.external {
            body["external"] = external.clone();
        }

        self.bus
            .publish_lifecycle(LifecycleEvent::BuildsetAdded, &args.repo_id, body.clone())
            .await?;
        self.notifier.notify(StatusUpdate::new(
            LifecycleEvent::BuildsetAdded.as_str(),
            &args.repo_id,
            PENDING,
            body,
        ));

        tracing::info!(
            repo_id = %ack.repo_id,
            buildset_id = %ack.buildset_id,
            number = ack.number,
            branch = %ack.branch,
            "buildset scheduled"
        );
        Ok(ack)
    }

    /// Announce a build cancellation.
    pub async fn cancel(&self, args: &CancelBuildArgs) -> Result<CancelBuildAck, BusError> {
        self.bus
            .publish_lifecycle(
                LifecycleEvent::BuildCancelled,
                &args.repo_id,
                json!({ "build_uuid": args.build_uuid }),
            )
            .await?;
        tracing::info!(repo_id = %args.repo_id, build_uuid = %args.build_uuid, "build cancelled");
        Ok(CancelBuildAck {
            build_uuid: args.build_uuid.clone(),
            cancelled: true,
        })
    }
}

/// Schedules build requests arriving from the broker.
///
/// Only the leader schedules. A request seen after demotion is handed back
/// to the broker for the next leader.
pub struct BuildRequestHandler {
    scheduler: Arc<Scheduler>,
    role: RoleHandle,
}

impl BuildRequestHandler {
    pub fn new(scheduler: Arc<Scheduler>, role: RoleHandle) -> Self {
        Self { scheduler, role }
    }
}

#[async_trait]
impl DeliveryHandler for BuildRequestHandler {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        let args: ScheduleBuildArgs = match serde_json::from_value(event.payload.clone()) {
            Ok(args) => args,
            Err(e) => {
                // Redelivery cannot fix a malformed request.
                tracing::error!(event_id = %event.id, error = %e, "dropping malformed build request");
                return Ok(());
            }
        };
        if !self.role.is_leader() {
            return Err(HandlerError::deferred(format!(
                "not the leader (role: {})",
                self.role.current()
            )));
        }
        self.scheduler
            .schedule(&args)
            .await
            .map(|_| ())
            .map_err(HandlerError::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryBroker, PublishPolicy};
    use crate::coordination::Role;
    use crate::retry::BackoffConfig;

    fn scheduler(broker: &InMemoryBroker, retries: u32) -> Scheduler {
        let policy = PublishPolicy {
            retries,
            attempt_timeout: Duration::from_millis(100),
            backoff: BackoffConfig::fixed(1, 5),
        };
        let bus = Arc::new(MessageBus::new(Arc::new(broker.clone()), policy));
        Scheduler::new(bus, NotificationDispatcher::disabled())
    }

    fn args(repo: &str) -> ScheduleBuildArgs {
        ScheduleBuildArgs {
            repo_id: repo.to_string(),
            branch: "master".to_string(),
            named_tree: "abc123".to_string(),
            builders: vec!["unit".to_string()],
            builders_from: None,
            external: None,
        }
    }

    #[tokio::test]
    async fn test_numbers_are_per_repository() {
        let numbers = BuildsetNumbers::local();
        assert_eq!(numbers.last("a").await.unwrap(), None);
        assert_eq!(numbers.next("a").await.unwrap(), 1);
        assert_eq!(numbers.next("a").await.unwrap(), 2);
        assert_eq!(numbers.next("b").await.unwrap(), 1);
        assert_eq!(numbers.last("a").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_numbers_continue_across_instances() {
        let backend: Arc<dyn CoordinationBackend> = Arc::new(InMemoryCoordination::default());
        let first = BuildsetNumbers::new(backend.clone(), "/bm/buildsets", Duration::from_secs(1));
        assert_eq!(first.next("repo").await.unwrap(), 1);
        assert_eq!(first.next("repo").await.unwrap(), 2);

        let second = BuildsetNumbers::new(backend, "/bm/buildsets/", Duration::from_secs(1));
        assert_eq!(second.last("repo").await.unwrap(), Some(2));
        assert_eq!(second.next("repo").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_numbers_are_distinct() {
        let numbers = Arc::new(BuildsetNumbers::local());
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let numbers = numbers.clone();
                tokio::spawn(async move { numbers.next("repo").await.unwrap() })
            })
            .collect();
        let mut got = Vec::new();
        for task in tasks {
            got.push(task.await.unwrap());
        }
        got.sort_unstable();
        assert_eq!(got, (1..=8).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_corrupt_counter_is_reported() {
        let backend = Arc::new(InMemoryCoordination::default());
        backend.create_persistent("/b/repo-r1", b"seven").await.unwrap();
        let numbers = BuildsetNumbers::new(backend, "/b", Duration::from_secs(1));

        let err = numbers.next("r1").await.unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidData { .. }));
    }

    #[tokio::test]
    async fn test_numbering_unavailable_fails_schedule() {
        let broker = InMemoryBroker::new();
        let backend = Arc::new(InMemoryCoordination::default());
        backend.set_unavailable(true);
        let scheduler = scheduler(&broker, 0).with_numbers(BuildsetNumbers::new(
            backend,
            "/b",
            Duration::from_secs(1),
        ));

        let err = scheduler.schedule(&args("repo-1")).await.unwrap_err();
        assert!(matches!(err, ScheduleError::Numbering(CoordinationError::Unavailable(_))));
        assert!(broker.confirmed().is_empty());
    }

    #[test]
    fn test_node_names_are_escaped() {
        assert_eq!(encode_node_name("org/repo.git"), "org%2Frepo%2Egit");
        assert_eq!(encode_node_name("plain-id_1"), "plain-id_1");
        let numbers = BuildsetNumbers::local();
        assert_eq!(numbers.path(".."), "/buildsets/repo-%2E%2E");
        assert_eq!(numbers.path(""), "/buildsets/repo-");
    }

    #[tokio::test]
    async fn test_schedule_publishes_buildset_added() {
        let broker = InMemoryBroker::new();
        let scheduler = scheduler(&broker, 0);

        let ack = scheduler.schedule(&args("repo-1")).await.unwrap();
        assert_eq!(ack.number, 1);
        assert_eq!(ack.status, "pending");

        let confirmed = broker.confirmed();
        assert_eq!(confirmed.len(), 2);
        assert_eq!(confirmed[0].payload["event_type"], "buildset-added");
        assert_eq!(confirmed[0].payload["buildset_id"], ack.buildset_id.as_str());
        assert_eq!(confirmed[1].routing_key, "integrations-notifications");
    }

    #[tokio::test]
    async fn test_schedule_fails_when_broker_down() {
        let broker = InMemoryBroker::new();
        broker.set_unavailable(true);
        let scheduler = scheduler(&broker, 1);

        let err = scheduler.schedule(&args("repo-1")).await.unwrap_err();
        assert!(matches!(err, ScheduleError::Bus(BusError::BrokerUnavailable { attempts: 2, .. })));
        // The number is spent anyway.
        assert_eq!(scheduler.numbers().last("repo-1").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_cancel_publishes_build_cancelled() {
        let broker = InMemoryBroker::new();
        let scheduler = scheduler(&broker, 0);

        let ack = scheduler
            .cancel(&CancelBuildArgs {
                repo_id: "repo-1".to_string(),
                build_uuid: "b-1".to_string(),
            })
            .await
            .unwrap();
        assert!(ack.cancelled);
        assert_eq!(broker.confirmed()[0].payload["event_type"], "build-cancelled");
    }

    #[tokio::test]
    async fn test_malformed_build_request_is_dropped() {
        let broker = InMemoryBroker::new();
        let handler = BuildRequestHandler::new(Arc::new(scheduler(&broker, 0)), RoleHandle::fixed(Role::Leader));

        let event = Event::new("build-requests", json!({"repo_id": "r"}));
        assert!(handler.handle(&event).await.is_ok());
        assert!(broker.confirmed().is_empty());
    }

    #[tokio::test]
    async fn test_build_request_schedules() {
        let broker = InMemoryBroker::new();
        let scheduler = Arc::new(scheduler(&broker, 0));
        let handler = BuildRequestHandler::new(scheduler.clone(), RoleHandle::fixed(Role::Leader));

        let event = Event::new("build-requests", serde_json::to_value(args("repo-9")).unwrap());
        handler.handle(&event).await.unwrap();
        assert_eq!(scheduler.numbers().last("repo-9").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_build_request_refused_after_demotion() {
        let broker = InMemoryBroker::new();
        let scheduler = Arc::new(scheduler(&broker, 0));

        for role in [Role::Follower, Role::Unknown] {
            let handler = BuildRequestHandler::new(scheduler.clone(), RoleHandle::fixed(role));
            let event = Event::new("build-requests", serde_json::to_value(args("repo-9")).unwrap());
            let err = handler.handle(&event).await.unwrap_err();
            match err {
                HandlerError::Deferred(reason) => assert!(reason.contains(role.as_str())),
                other => panic!("expected a deferral, got {other:?}"),
            }
        }
        assert!(broker.confirmed().is_empty());
        assert_eq!(scheduler.numbers().last("repo-9").await.unwrap(), None);
    }
}
