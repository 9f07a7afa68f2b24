//! Secure RPC Server
//!
//! Accepts TCP connections (optionally TLS), authenticates each one with
//! the shared access token, then serves pipelined commands. See
//! [`connection`] for the per-connection state machine.

pub mod connection;
pub mod dispatch;
pub mod handlers;
pub mod tls;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use buildmaster_protocol::MAX_FRAME_BYTES;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::auth::CredentialVerifier;
use crate::config::MasterConfig;
use crate::telemetry::connection_span;

pub use connection::{Connection, ConnectionError, ConnectionState};
pub use dispatch::Dispatcher;
pub use handlers::{CommandError, CommandHandler, HandlerContext};

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Listener settings
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen_addr: String,
    pub max_in_flight: usize,
    pub max_frame_bytes: usize,
    pub tls_handshake_timeout: Duration,
    pub auth_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            max_in_flight: 32,
            max_frame_bytes: MAX_FRAME_BYTES,
            tls_handshake_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

impl ServerSettings {
    pub fn from_master(config: &MasterConfig) -> Self {
        Self {
            listen_addr: config.server.listen_addr(),
            max_in_flight: config.server.max_in_flight,
            max_frame_bytes: config.server.max_frame_bytes,
            tls_handshake_timeout: config.timeouts.tls_handshake(),
            auth_timeout: config.timeouts.auth(),
            idle_timeout: config.timeouts.idle_connection(),
        }
    }
}

/// State shared by every connection of one server.
pub(crate) struct Shared {
    pub(crate) settings: ServerSettings,
    pub(crate) acceptor: Option<TlsAcceptor>,
    pub(crate) verifier: Arc<CredentialVerifier>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) ctx: HandlerContext,
}

/// A bound RPC listener.
pub struct RpcServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl RpcServer {
    /// Bind the listener. Failure here is fatal for the process.
    pub async fn bind(
        settings: ServerSettings,
        acceptor: Option<TlsAcceptor>,
        verifier: Arc<CredentialVerifier>,
        dispatcher: Arc<Dispatcher>,
        ctx: HandlerContext,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&settings.listen_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: settings.listen_addr.clone(),
                source,
            })?;
        tracing::info!(
            addr = %settings.listen_addr,
            tls = acceptor.is_some(),
            max_in_flight = settings.max_in_flight,
            "RPC listener bound"
        );

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                settings,
                acceptor,
                verifier,
                dispatcher,
                ctx,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.shared.dispatcher)
    }

    /// Accept connections until `shutdown` fires, then close every
    /// connection and wait for them to finish.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let connections = TaskTracker::new();
        let tls = self.shared.acceptor.is_some();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let span = connection_span(&peer.to_string(), tls);
                        connections.spawn(
                            connection::serve(stream, peer, Arc::clone(&self.shared), shutdown.child_token())
                                .instrument(span),
                        );
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        connections.close();
        tracing::info!(open = connections.len(), "listener stopping, closing connections");
        connections.wait().await;
        Ok(())
    }
}
