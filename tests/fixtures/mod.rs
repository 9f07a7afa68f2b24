//! Shared helpers for integration tests
//!
//! - Framed JSON client (plaintext and TLS)
//! - Throwaway certificates
//! - Config built through the normal loader
//! - In-process server with mock services

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use buildmaster::auth::{CredentialVerifier, TokenDigest};
use buildmaster::bus::{InMemoryBroker, MessageBus, PublishPolicy};
use buildmaster::config::{EffectiveConfig, MasterConfig};
use buildmaster::coordination::{LeadershipListener, RoleHandle};
use buildmaster::notify::NotificationDispatcher;
use buildmaster::retry::BackoffConfig;
use buildmaster::scheduler::Scheduler;
use buildmaster::server::{Dispatcher, HandlerContext, RpcServer, ServerSettings};
use buildmaster::services::{tls::client_config_with_roots, MockTransport, ServicePool};
use buildmaster_protocol::{Request, Response};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::RootCertStore;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

/// Access token every test master accepts.
pub const TEST_TOKEN: &str = "abc123";

/// A port nothing is listening on right now.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

// =============================================================================
// Certificates
// =============================================================================

/// Self-signed certificate for `localhost`, written to a temp dir.
pub struct TestCert {
    pub cert_pem: String,
    pub key_pem: String,
    pub certfile: PathBuf,
    pub keyfile: PathBuf,
    _dir: TempDir,
}

impl TestCert {
    pub fn acceptor(&self) -> TlsAcceptor {
        buildmaster::server::tls::acceptor_from_pem(self.cert_pem.as_bytes(), self.key_pem.as_bytes()).unwrap()
    }

    /// Root store trusting only this certificate.
    pub fn roots(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots
            .add(CertificateDer::from_pem_slice(self.cert_pem.as_bytes()).unwrap())
            .unwrap();
        roots
    }
}

pub fn self_signed_cert() -> TestCert {
    let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let cert = params.self_signed(&key_pair).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let certfile = dir.path().join("master.crt");
    let keyfile = dir.path().join("master.key");
    std::fs::write(&certfile, cert.pem()).unwrap();
    std::fs::write(&keyfile, key_pair.serialize_pem()).unwrap();

    TestCert {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
        certfile,
        keyfile,
        _dir: dir,
    }
}

// =============================================================================
// Config
// =============================================================================

/// Master config loaded from a TOML file, listening on `port`.
pub fn master_config(instance_id: &str, port: u16, tls: Option<&TestCert>) -> MasterConfig {
    let tls_keys = match tls {
        Some(cert) => format!(
            "certfile = {:?}\nkeyfile = {:?}\n",
            cert.certfile.display().to_string(),
            cert.keyfile.display().to_string()
        ),
        None => String::new(),
    };
    let toml = format!(
        r#"
instance_id = "{instance_id}"

[server]
bind = "127.0.0.1"
port = {port}
{tls_keys}
[access]
token_digest = "{digest}"

[coordination]
session_timeout_ms = 2000
heartbeat_interval_ms = 100

[coordination.reregister_backoff]
initial_delay_ms = 10
max_delay_ms = 50

[broker]
publish_retries = 2

[broker.publish_backoff]
initial_delay_ms = 1
max_delay_ms = 5

[timeouts]
auth_ms = 1000
idle_connection_ms = 5000
"#,
        digest = TokenDigest::of(TEST_TOKEN).to_hex(),
    );

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("buildmaster.toml");
    std::fs::write(&path, toml).unwrap();
    EffectiveConfig::load(Some(&path), Vec::<(String, String)>::new())
        .unwrap()
        .config
}

// =============================================================================
// In-process server
// =============================================================================

/// A running server with inspectable collaborators.
pub struct TestServer {
    pub addr: SocketAddr,
    pub dispatcher: Arc<Dispatcher>,
    pub broker: InMemoryBroker,
    pub poller: Arc<MockTransport>,
    pub secrets: Arc<MockTransport>,
    pub shutdown: CancellationToken,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn fast_publish_policy() -> PublishPolicy {
    PublishPolicy {
        retries: 2,
        attempt_timeout: std::time::Duration::from_millis(200),
        backoff: BackoffConfig::fixed(1, 5),
    }
}

pub async fn start_server(role: RoleHandle, acceptor: Option<TlsAcceptor>) -> TestServer {
    start_server_with(role, acceptor, ServerSettings::default()).await
}

pub async fn start_server_with(role: RoleHandle, acceptor: Option<TlsAcceptor>, settings: ServerSettings) -> TestServer {
    let broker = InMemoryBroker::new();
    let bus = Arc::new(MessageBus::new(Arc::new(broker.clone()), fast_publish_policy()));
    let scheduler = Arc::new(Scheduler::new(bus, NotificationDispatcher::disabled()));
    let poller = Arc::new(MockTransport::new());
    let secrets = Arc::new(MockTransport::new());
    let ctx = HandlerContext::new(
        "test-master",
        role,
        scheduler,
        ServicePool::new(poller.clone(), secrets.clone()),
        NotificationDispatcher::disabled(),
    );
    let dispatcher = Arc::new(Dispatcher::default());
    let verifier = Arc::new(CredentialVerifier::new(TokenDigest::of(TEST_TOKEN)));

    let server = RpcServer::bind(settings, acceptor, verifier, dispatcher.clone(), ctx)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.run(shutdown.clone()));

    TestServer {
        addr,
        dispatcher,
        broker,
        poller,
        secrets,
        shutdown,
    }
}

// =============================================================================
// Client
// =============================================================================

/// Framed JSON client speaking the master protocol.
pub struct Client<S> {
    framed: Framed<S, LengthDelimitedCodec>,
}

impl Client<TcpStream> {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self::new(stream)
    }
}

impl Client<TlsStream<TcpStream>> {
    pub async fn connect_tls(addr: SocketAddr, roots: RootCertStore) -> Self {
        let connector = TlsConnector::from(client_config_with_roots(roots).unwrap());
        let stream = TcpStream::connect(addr).await.unwrap();
        let server_name = ServerName::try_from("localhost").unwrap().to_owned();
        let tls = connector.connect(server_name, stream).await.unwrap();
        Self::new(tls)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
        }
    }

    pub async fn send(&mut self, request: &Request) {
        self.send_raw(serde_json::to_vec(request).unwrap()).await;
    }

    pub async fn send_raw(&mut self, payload: Vec<u8>) {
        self.framed.send(Bytes::from(payload)).await.unwrap();
    }

    /// Next response, or `None` once the server closed the connection.
    pub async fn recv(&mut self) -> Option<Response> {
        let next = tokio::time::timeout(std::time::Duration::from_secs(5), self.framed.next())
            .await
            .expect("no response within 5s");
        match next {
            Some(Ok(frame)) => Some(serde_json::from_slice(&frame).unwrap()),
            _ => None,
        }
    }

    pub async fn call(&mut self, request: Request) -> Response {
        self.send(&request).await;
        self.recv().await.expect("connection closed before reply")
    }

    pub async fn authenticate(&mut self, token: &str) -> Response {
        self.call(Request::authenticate("auth", token)).await
    }
}

// =============================================================================
// Leadership recording
// =============================================================================

/// Shared, ordered log of leadership transitions across instances.
#[derive(Clone, Default)]
pub struct TransitionLog(Arc<Mutex<Vec<(String, &'static str)>>>);

impl TransitionLog {
    pub fn listener(&self, instance: &str) -> Arc<dyn LeadershipListener> {
        Arc::new(Recorder {
            instance: instance.to_string(),
            log: self.clone(),
        })
    }

    pub fn entries(&self) -> Vec<(String, &'static str)> {
        self.0.lock().unwrap().clone()
    }
}

struct Recorder {
    instance: String,
    log: TransitionLog,
}

#[async_trait]
impl LeadershipListener for Recorder {
    async fn on_elected(&self) {
        self.log.0.lock().unwrap().push((self.instance.clone(), "elected"));
    }

    async fn on_demoted(&self) {
        self.log.0.lock().unwrap().push((self.instance.clone(), "demoted"));
    }
}
