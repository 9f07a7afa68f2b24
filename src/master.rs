//! Process wiring.
//!
//! Builds every component from one [`MasterConfig`] and runs them until
//! shutdown. Leadership gates two things: leader-only commands (checked by
//! the dispatcher) and consumption of inbound build requests (started and
//! stopped by [`BuildRequestConsumer`]).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::CredentialVerifier;
use crate::bus::{
    AmqpBroker, Broker, BusError, Consumer, ConsumerConfig, DeliveryHandler, InMemoryBroker, MessageBus, PublishPolicy,
};
use crate::config::{ConfigError, MasterConfig};
use crate::coordination::{
    CoordinationBackend, CoordinationClient, ElectionConfig, InMemoryCoordination, LeadershipListener, RoleHandle,
    ZooKeeperCoordination,
};
use crate::notify::NotificationDispatcher;
use crate::scheduler::{BuildRequestHandler, BuildsetNumbers, Scheduler};
use crate::server::{tls, Dispatcher, HandlerContext, RpcServer, ServerError, ServerSettings};
use crate::services::{ServiceError, ServicePool};

/// Bound on waiting for detached side effects at shutdown.
const DETACHED_DRAIN: Duration = Duration::from_secs(10);

/// Startup failures
#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// External systems the master talks to.
pub struct Backends {
    pub coordination: Arc<dyn CoordinationBackend>,
    pub broker: Arc<dyn Broker>,
    /// `None` builds TCP clients from the endpoint config.
    pub services: Option<ServicePool>,
}

impl Backends {
    /// The ZooKeeper ensemble and AMQP broker named in `config`.
    pub async fn connect(config: &MasterConfig) -> Result<Self, MasterError> {
        let coordination = ZooKeeperCoordination::from_config(&config.coordination);
        let broker = AmqpBroker::connect(&config.broker).await.map_err(BusError::from)?;
        Ok(Self {
            coordination: Arc::new(coordination),
            broker: Arc::new(broker),
            services: None,
        })
    }

    /// In-process coordination and broker for tests. Every instance built
    /// this way leads its own private election.
    pub fn in_memory() -> Self {
        Self {
            coordination: Arc::new(InMemoryCoordination::default()),
            broker: Arc::new(InMemoryBroker::new()),
            services: None,
        }
    }
}

/// Starts and stops build-request consumption with leadership.
pub struct BuildRequestConsumer {
    queue: String,
    consumer: Arc<Consumer>,
    handler: Arc<dyn DeliveryHandler>,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl BuildRequestConsumer {
    pub fn new(queue: impl Into<String>, consumer: Arc<Consumer>, handler: Arc<dyn DeliveryHandler>) -> Self {
        Self {
            queue: queue.into(),
            consumer,
            handler,
            running: Mutex::new(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    async fn stop(&self) {
        let Some((cancel, task)) = self.running.lock().await.take() else {
            return;
        };
        cancel.cancel();
        if let Err(e) = task.await {
            tracing::error!(error = %e, "build request consumer task failed");
        }
    }
}

#[async_trait]
impl LeadershipListener for BuildRequestConsumer {
    async fn on_elected(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let consumer = Arc::clone(&self.consumer);
        let handler = Arc::clone(&self.handler);
        let queue = self.queue.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = consumer.run(&queue, handler, token).await {
                tracing::error!(queue = %queue, error = %e, "build request consumer failed");
            }
        });
        *running = Some((cancel, task));
    }

    async fn on_demoted(&self) {
        self.stop().await;
    }
}

/// A running master.
pub struct Master {
    config: Arc<MasterConfig>,
    role: RoleHandle,
    local_addr: std::net::SocketAddr,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
    server: JoinHandle<Result<(), ServerError>>,
    election: CoordinationClient,
    consumer: Arc<BuildRequestConsumer>,
    detached: tokio_util::task::TaskTracker,
}

impl Master {
    /// Build and start every component.
    pub async fn start(config: MasterConfig, backends: Backends) -> Result<Self, MasterError> {
        config.validate()?;
        let config = Arc::new(config);
        tracing::info!(instance_id = %config.instance_id, "starting master");

        for name in config.insecure_endpoints() {
            tracing::warn!(endpoint = name, "TLS enabled without certificate validation");
        }

        let verifier = Arc::new(CredentialVerifier::new(config.access.digest()?));
        let acceptor = match (&config.server.certfile, &config.server.keyfile) {
            (Some(cert), Some(key)) => Some(tls::load_acceptor(cert, key)?),
            _ => None,
        };
        let services = match backends.services {
            Some(services) => services,
            None => ServicePool::from_config(&config)?,
        };
        let notifier = NotificationDispatcher::new(&config.notifications, config.timeouts.notification());

        let queue = config.broker.build_requests_queue.clone();
        backends.broker.bind(&queue, &queue).await.map_err(BusError::from)?;
        let bus = Arc::new(MessageBus::new(
            Arc::clone(&backends.broker),
            PublishPolicy::from_master(&config),
        ));
        let numbers = BuildsetNumbers::new(
            Arc::clone(&backends.coordination),
            config.coordination.buildsets_path.clone(),
            config.timeouts.coordination_ping(),
        );
        let scheduler = Arc::new(Scheduler::new(bus, notifier.clone()).with_numbers(numbers));

        let pending = CoordinationClient::prepare(backends.coordination, ElectionConfig::from_master(&config));
        let role = pending.role();
        let consumer = Arc::new(BuildRequestConsumer::new(
            queue,
            Arc::new(Consumer::new(Arc::clone(&backends.broker), ConsumerConfig::from_master(&config))),
            Arc::new(BuildRequestHandler::new(Arc::clone(&scheduler), role.clone())),
        ));

        tracing::info!(hosts = ?config.coordination.hosts, path = %config.coordination.election_path, "joining election");
        let election = pending.start(vec![consumer.clone() as Arc<dyn LeadershipListener>]);

        let ctx = HandlerContext::new(&config.instance_id, role.clone(), scheduler, services, notifier);
        let detached = ctx.detached_tasks();
        let dispatcher = Arc::new(Dispatcher::default());
        let server = match RpcServer::bind(
            ServerSettings::from_master(&config),
            acceptor,
            verifier,
            Arc::clone(&dispatcher),
            ctx,
        )
        .await
        {
            Ok(server) => server,
            Err(e) => {
                election.shutdown().await;
                return Err(e.into());
            }
        };
        let local_addr = server.local_addr()?;

        let shutdown = CancellationToken::new();
        let server = tokio::spawn(server.run(shutdown.clone()));

        Ok(Self {
            config,
            role,
            local_addr,
            dispatcher,
            shutdown,
            server,
            election,
            consumer,
            detached,
        })
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn role(&self) -> RoleHandle {
        self.role.clone()
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub async fn consuming(&self) -> bool {
        self.consumer.is_running().await
    }

    /// Stop accepting, leave the election and drain detached work.
    pub async fn shutdown(self) -> Result<(), MasterError> {
        tracing::info!("master shutting down");
        self.shutdown.cancel();
        let served = match self.server.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "server task failed");
                Ok(())
            }
        };

        self.election.shutdown().await;
        self.consumer.stop().await;

        self.detached.close();
        if tokio::time::timeout(DETACHED_DRAIN, self.detached.wait()).await.is_err() {
            tracing::warn!(pending = self.detached.len(), "detached tasks still running at shutdown");
        }
        tracing::info!("master stopped");
        Ok(served?)
    }

    /// Run until ctrl-c, then shut down.
    pub async fn run_until_ctrl_c(self) -> Result<(), MasterError> {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
        self.shutdown().await
    }
}
