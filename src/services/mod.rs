//! Service Client Pool
//!
//! Outbound calls to the poller and secrets services. Each call is one
//! request frame and one reply frame over a fresh connection; there is no
//! call-level retry.

pub mod poller;
pub mod secrets;
pub mod tls;
pub mod transport;

use std::sync::Arc;

use buildmaster_protocol::RpcError;

use crate::config::MasterConfig;

pub use poller::PollerClient;
pub use secrets::SecretsClient;
pub use transport::{CallRequest, MockReply, MockTransport, TcpTransport, Transport};

/// Outbound call errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("certificate for {endpoint} rejected: {reason}")]
    Certificate { endpoint: String, reason: String },

    #[error("connecting to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("call to {endpoint} timed out after {after_ms}ms")]
    Timeout { endpoint: String, after_ms: u64 },

    #[error("I/O error talking to {endpoint}: {source}")]
    Io {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("bad reply from {endpoint}: {message}")]
    Protocol { endpoint: String, message: String },

    #[error("{endpoint} returned {error}")]
    Remote { endpoint: String, error: RpcError },
}

impl ServiceError {
    /// Map to the wire error returned to the RPC caller.
    pub fn to_rpc_error(&self, service: &str) -> RpcError {
        match self {
            Self::Certificate { endpoint, .. } => RpcError::certificate(endpoint),
            Self::Timeout { after_ms, .. } => RpcError::timeout(&format!("{} call", service), *after_ms),
            Self::Remote { error, .. } => RpcError::service(service, error.message.clone()),
            other => RpcError::service(service, other.to_string()),
        }
    }
}

/// Clients for every outbound service.
#[derive(Clone)]
pub struct ServicePool {
    pub poller: PollerClient,
    pub secrets: SecretsClient,
}

impl ServicePool {
    pub fn new(poller: Arc<dyn Transport>, secrets: Arc<dyn Transport>) -> Self {
        Self {
            poller: PollerClient::new(poller),
            secrets: SecretsClient::new(secrets),
        }
    }

    /// TCP transports for the configured endpoints.
    pub fn from_config(config: &MasterConfig) -> Result<Self, ServiceError> {
        let poller = TcpTransport::new(&config.poller, &config.timeouts)?;
        let secrets = TcpTransport::new(&config.secrets, &config.timeouts)?;
        Ok(Self::new(Arc::new(poller), Arc::new(secrets)))
    }
}
