//! Full master over TLS: config file, election, RPC, broker and services

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use buildmaster::bus::{Broker, InMemoryBroker};
use buildmaster::coordination::{CoordinationClient, ElectionConfig, InMemoryCoordination, Role};
use buildmaster::retry::BackoffConfig;
use buildmaster::services::{MockTransport, ServicePool};
use buildmaster::{Backends, Master};
use buildmaster_protocol::ops::{names, HealthcheckReply};
use buildmaster_protocol::{ErrorCode, Request, MASTER_VERSION};
use fixtures::{free_port, master_config, self_signed_cert, Client, TEST_TOKEN};
use serde_json::json;

struct Cluster {
    backend: Arc<InMemoryCoordination>,
    broker: InMemoryBroker,
    poller: Arc<MockTransport>,
    secrets: Arc<MockTransport>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            backend: Arc::new(InMemoryCoordination::default()),
            broker: InMemoryBroker::new(),
            poller: Arc::new(MockTransport::new()),
            secrets: Arc::new(MockTransport::new()),
        }
    }

    fn backends(&self) -> Backends {
        Backends {
            coordination: self.backend.clone(),
            broker: Arc::new(self.broker.clone()),
            services: Some(ServicePool::new(self.poller.clone(), self.secrets.clone())),
        }
    }

    async fn peer(&self, instance: &str) -> CoordinationClient {
        let election = ElectionConfig::new("/buildmaster/election", instance)
            .with_heartbeat(Duration::from_millis(50), Duration::from_millis(200))
            .with_backoff(BackoffConfig::fixed(20, 100));
        let peer = CoordinationClient::spawn(self.backend.clone(), election, Vec::new());
        tokio::time::timeout(Duration::from_secs(5), peer.role().wait_for(Role::Leader))
            .await
            .expect("peer never became leader");
        peer
    }

    async fn expire(&self, peer: &CoordinationClient) {
        let node = peer.role().membership().node.unwrap();
        let session = self.backend.owner_of(&node).unwrap();
        assert!(self.backend.expire_session(session).await);
    }
}

async fn wait_for(master: &Master, role: Role) {
    tokio::time::timeout(Duration::from_secs(5), master.role().wait_for(role))
        .await
        .expect("master role transition timed out");
}

async fn wait_consuming(master: &Master, expected: bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while master.consuming().await != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("consumer state never changed");
}

fn schedule(id: &str, named_tree: &str) -> Request {
    Request::new(
        id,
        names::SCHEDULE_BUILD,
        json!({"repo_id": "repo-1", "branch": "master", "named_tree": named_tree}),
    )
}

// ============================================================================
// Test 1: Follower refuses over TLS, then schedules after promotion
// ============================================================================

#[tokio::test]
async fn test_tls_master_follower_then_leader() {
    let cluster = Cluster::new();
    let peer = cluster.peer("peer").await;

    let cert = self_signed_cert();
    let config = master_config("master-e2e", free_port(), Some(&cert));
    let master = Master::start(config, cluster.backends()).await.unwrap();
    wait_for(&master, Role::Follower).await;
    assert!(!master.consuming().await);

    let mut client = Client::connect_tls(master.local_addr(), cert.roots()).await;
    let auth = client.authenticate(TEST_TOKEN).await;
    assert!(auth.ok);
    assert_eq!(auth.body.unwrap()["instance_id"], "master-e2e");

    let refused = client.call(schedule("s1", "v1")).await;
    assert_eq!(refused.error.unwrap().code, ErrorCode::NotLeader);

    cluster.expire(&peer).await;
    wait_for(&master, Role::Leader).await;
    wait_consuming(&master, true).await;

    let accepted = client.call(schedule("s2", "v2")).await;
    assert!(accepted.ok, "schedule failed: {:?}", accepted.error);
    assert_eq!(accepted.id, "s2");
    assert_eq!(accepted.body.unwrap()["number"], 1);

    let health = client.call(Request::new("h", names::HEALTHCHECK, json!({}))).await;
    let health: HealthcheckReply = serde_json::from_value(health.body.unwrap()).unwrap();
    assert_eq!(health.role, "leader");
    assert_eq!(health.version, MASTER_VERSION);

    master.shutdown().await.unwrap();
    peer.shutdown().await;
}

// ============================================================================
// Test 2: Leader consumes queued build requests
// ============================================================================

#[tokio::test]
async fn test_leader_consumes_build_requests() {
    let cluster = Cluster::new();
    let config = master_config("master-consumer", free_port(), None);
    let queue = config.broker.build_requests_queue.clone();
    let master = Master::start(config, cluster.backends()).await.unwrap();
    wait_for(&master, Role::Leader).await;
    wait_consuming(&master, true).await;

    cluster
        .broker
        .publish(&buildmaster::bus::Event::new(
            &queue,
            json!({"repo_id": "repo-q", "branch": "dev", "named_tree": "feedface"}),
        ))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let added = cluster
                .broker
                .confirmed()
                .iter()
                .filter(|e| e.payload["event_type"] == "buildset-added" && e.payload["repository_id"] == "repo-q")
                .count();
            if added == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queued build request never scheduled");
    assert_eq!(cluster.broker.depth(&queue), 0);

    master.shutdown().await.unwrap();
}

// ============================================================================
// Test 3: Demotion stops consumption
// ============================================================================

#[tokio::test]
async fn test_demotion_stops_consumer() {
    let cluster = Cluster::new();
    let config = master_config("master-demoted", free_port(), None);
    let master = Master::start(config, cluster.backends()).await.unwrap();
    wait_for(&master, Role::Leader).await;
    wait_consuming(&master, true).await;

    let standby = CoordinationClient::spawn(
        cluster.backend.clone(),
        ElectionConfig::new("/buildmaster/election", "standby")
            .with_heartbeat(Duration::from_millis(50), Duration::from_millis(200))
            .with_backoff(BackoffConfig::fixed(20, 100)),
        Vec::new(),
    );
    tokio::time::timeout(Duration::from_secs(5), standby.role().wait_for(Role::Follower))
        .await
        .expect("standby never joined");

    let node = master.role().membership().node.unwrap();
    let session = cluster.backend.owner_of(&node).unwrap();
    cluster.backend.expire_session(session).await;

    tokio::time::timeout(Duration::from_secs(5), standby.role().wait_for(Role::Leader))
        .await
        .expect("standby never promoted");
    wait_consuming(&master, false).await;
    wait_for(&master, Role::Follower).await;
    assert!(!master.consuming().await);

    standby.shutdown().await;
    master.shutdown().await.unwrap();
}

// ============================================================================
// Test 4: Secret writes finish even when the client hangs up
// ============================================================================

#[tokio::test]
async fn test_secret_write_survives_disconnect() {
    let cluster = Cluster::new();
    cluster.secrets.set_delay(Some(Duration::from_millis(200)));
    let config = master_config("master-secrets", free_port(), None);
    let master = Master::start(config, cluster.backends()).await.unwrap();

    let mut client = Client::connect(master.local_addr()).await;
    assert!(client.authenticate(TEST_TOKEN).await.ok);
    client
        .send(&Request::new(
            "sec",
            names::ADD_OR_UPDATE_SECRET,
            json!({"owner": "repo-1", "key": "API_KEY", "value": "s3cr3t"}),
        ))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(client);

    tokio::time::timeout(Duration::from_secs(5), async {
        while cluster.secrets.calls().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("secret write never reached the service");

    // Shutdown waits for the in-flight write.
    master.shutdown().await.unwrap();
    let calls = cluster.secrets.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].action, "add-or-update-secret");
    assert_eq!(calls[0].body["value"], "s3cr3t");
}

// ============================================================================
// Test 5: Binding an occupied port fails startup
// ============================================================================

#[tokio::test]
async fn test_port_in_use_fails_startup() {
    let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = holder.local_addr().unwrap().port();

    let cluster = Cluster::new();
    let config = master_config("master-busy", port, None);
    let err = Master::start(config, cluster.backends()).await.err().expect("start should fail");
    assert!(err.to_string().contains(&port.to_string()), "{err}");
}

// ============================================================================
// Test 6: Buildset numbers continue after failover
// ============================================================================

#[tokio::test]
async fn test_buildset_numbers_continue_after_failover() {
    let cluster = Cluster::new();
    let first = Master::start(master_config("master-a", free_port(), None), cluster.backends())
        .await
        .unwrap();
    wait_for(&first, Role::Leader).await;
    let second = Master::start(master_config("master-b", free_port(), None), cluster.backends())
        .await
        .unwrap();
    wait_for(&second, Role::Follower).await;

    let mut client = Client::connect(first.local_addr()).await;
    assert!(client.authenticate(TEST_TOKEN).await.ok);
    for (id, expected) in [("a1", 1), ("a2", 2)] {
        let reply = client.call(schedule(id, id)).await;
        assert!(reply.ok, "schedule failed: {:?}", reply.error);
        assert_eq!(reply.body.unwrap()["number"], expected);
    }
    drop(client);
    first.shutdown().await.unwrap();

    wait_for(&second, Role::Leader).await;
    let mut client = Client::connect(second.local_addr()).await;
    assert!(client.authenticate(TEST_TOKEN).await.ok);
    let reply = client.call(schedule("b1", "b1")).await;
    assert!(reply.ok, "schedule failed: {:?}", reply.error);
    assert_eq!(reply.body.unwrap()["number"], 3);

    second.shutdown().await.unwrap();
}
