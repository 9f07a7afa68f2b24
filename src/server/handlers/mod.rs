//! Command handlers for the master RPC.
//!
//! Each command has a handler type implementing [`CommandHandler`]. The
//! dispatcher owns the registry and enforces leader gating before a handler
//! runs, so handlers never check the role themselves.

pub mod build;
pub mod health;
pub mod notify;
pub mod poll;
pub mod secrets;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use buildmaster_protocol::{ErrorCode, RpcError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::task::TaskTracker;

use crate::bus::BusError;
use crate::coordination::{CoordinationError, Role, RoleHandle};
use crate::notify::NotificationDispatcher;
use crate::scheduler::{ScheduleError, Scheduler};
use crate::services::{ServiceError, ServicePool};

/// Failure of one command. Converted to the wire error at the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("not the leader (role: {0})")]
    NotLeader(Role),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("coordination failed: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("{service} call failed: {source}")]
    Service {
        service: &'static str,
        #[source]
        source: ServiceError,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl CommandError {
    pub fn service(service: &'static str) -> impl FnOnce(ServiceError) -> Self {
        move |source| Self::Service { service, source }
    }

    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            Self::InvalidArgs(message) => RpcError::invalid_request(message.clone()),
            Self::NotLeader(role) => RpcError::not_leader(role.as_str()),
            Self::Bus(BusError::BrokerUnavailable { attempts, .. }) => RpcError::broker_unavailable(*attempts),
            Self::Bus(other) => RpcError::new(ErrorCode::BrokerUnavailable, other.to_string()),
            Self::Coordination(CoordinationError::Timeout { operation, after_ms }) => {
                RpcError::timeout(&format!("coordination {}", operation), *after_ms)
            }
            Self::Coordination(other) => RpcError::service("coordination", other.to_string()),
            Self::Service { service, source } => source.to_rpc_error(service),
            Self::Internal(message) => RpcError::internal(message.clone()),
        }
    }
}

impl From<ScheduleError> for CommandError {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::Bus(e) => Self::Bus(e),
            ScheduleError::Numbering(e) => Self::Coordination(e),
        }
    }
}

/// Deserialize command arguments.
pub fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, CommandError> {
    serde_json::from_value(args).map_err(|e| CommandError::InvalidArgs(e.to_string()))
}

/// Serialize a reply body.
pub fn to_body<T: Serialize>(reply: &T) -> Result<Value, CommandError> {
    serde_json::to_value(reply).map_err(|e| CommandError::Internal(format!("failed to serialize reply: {}", e)))
}

/// Everything a handler may use. Cheap to clone.
#[derive(Clone)]
pub struct HandlerContext {
    instance_id: Arc<str>,
    role: RoleHandle,
    scheduler: Arc<Scheduler>,
    services: ServicePool,
    notifier: NotificationDispatcher,
    detached: TaskTracker,
}

impl HandlerContext {
    pub fn new(
        instance_id: &str,
        role: RoleHandle,
        scheduler: Arc<Scheduler>,
        services: ServicePool,
        notifier: NotificationDispatcher,
    ) -> Self {
        Self {
            instance_id: Arc::from(instance_id),
            role,
            scheduler,
            services,
            notifier,
            detached: TaskTracker::new(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn role(&self) -> &RoleHandle {
        &self.role
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn services(&self) -> &ServicePool {
        &self.services
    }

    pub fn notifier(&self) -> &NotificationDispatcher {
        &self.notifier
    }

    /// Run `fut` in a task that outlives the connection and wait for it.
    ///
    /// If the connection closes while waiting, only the wait is cancelled;
    /// the side effect runs to completion.
    pub async fn detached<F, T>(&self, fut: F) -> Result<T, CommandError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.detached
            .spawn(fut)
            .await
            .map_err(|e| CommandError::Internal(format!("detached task failed: {}", e)))
    }

    /// Tracker for detached work, drained on shutdown.
    pub fn detached_tasks(&self) -> TaskTracker {
        self.detached.clone()
    }
}

/// A registered command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Command name on the wire.
    fn name(&self) -> &'static str;

    /// Whether only the leader may run this command.
    fn requires_leader(&self) -> bool {
        false
    }

    async fn handle(&self, ctx: &HandlerContext, args: Value) -> Result<Value, CommandError>;
}

/// Every command the master serves.
pub fn default_handlers() -> Vec<Arc<dyn CommandHandler>> {
    vec![
        Arc::new(health::Healthcheck),
        Arc::new(health::LeaderStatus),
        Arc::new(build::ScheduleBuild),
        Arc::new(build::CancelBuild),
        Arc::new(poll::PollRepo),
        Arc::new(secrets::AddOrUpdateSecret),
        Arc::new(secrets::RemoveSecret),
        Arc::new(secrets::GetSecrets),
        Arc::new(secrets::RemoveAllSecrets),
        Arc::new(notify::SendEmail),
    ]
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::bus::{InMemoryBroker, MessageBus, PublishPolicy};
    use crate::retry::BackoffConfig;
    use crate::services::MockTransport;
    use std::time::Duration;

    pub(crate) struct TestContext {
        pub ctx: HandlerContext,
        pub broker: InMemoryBroker,
        pub poller: Arc<MockTransport>,
        pub secrets: Arc<MockTransport>,
    }

    pub(crate) fn context(role: Role) -> TestContext {
        let broker = InMemoryBroker::new();
        let policy = PublishPolicy {
            retries: 1,
            attempt_timeout: Duration::from_millis(100),
            backoff: BackoffConfig::fixed(1, 5),
        };
        let bus = Arc::new(MessageBus::new(Arc::new(broker.clone()), policy));
        let scheduler = Arc::new(Scheduler::new(bus, NotificationDispatcher::disabled()));
        let poller = Arc::new(MockTransport::new());
        let secrets = Arc::new(MockTransport::new());
        let services = ServicePool::new(poller.clone(), secrets.clone());
        let ctx = HandlerContext::new(
            "test-master",
            RoleHandle::fixed(role),
            scheduler,
            services,
            NotificationDispatcher::disabled(),
        );
        TestContext {
            ctx,
            broker,
            poller,
            secrets,
        }
    }
}
