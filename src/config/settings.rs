//! Typed master configuration
//!
//! `MasterConfig` is deserialized once from the merged layers and shared
//! read-only behind an `Arc` for the life of the process.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};

use super::effective::ConfigError;
use crate::auth::TokenDigest;
use crate::retry::BackoffConfig;
use crate::timeout::TimeoutConfig;

/// Upper bound on broker publish retries.
const MAX_PUBLISH_RETRIES: u32 = 20;

/// Complete master configuration
#[derive(Debug, Deserialize)]
pub struct MasterConfig {
    /// Identity reported by healthcheck and stored in the election node
    #[serde(default)]
    pub instance_id: String,
    pub server: ServerConfig,
    pub access: AccessConfig,
    pub coordination: CoordinationConfig,
    pub broker: BrokerConfig,
    pub poller: EndpointConfig,
    pub secrets: EndpointConfig,
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// RPC listener settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// PEM certificate chain; TLS is enabled when both files are set
    #[serde(default)]
    pub certfile: Option<PathBuf>,
    #[serde(default)]
    pub keyfile: Option<PathBuf>,
    pub max_in_flight: usize,
    pub max_frame_bytes: usize,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn uses_tls(&self) -> bool {
        self.certfile.is_some() && self.keyfile.is_some()
    }
}

/// Access credential settings
#[derive(Debug, Clone, Deserialize)]
pub struct AccessConfig {
    /// Hex SHA-256 digest of the access token
    pub token_digest: String,
}

impl AccessConfig {
    pub fn digest(&self) -> Result<TokenDigest, ConfigError> {
        if self.token_digest.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "access.token_digest is required".to_string(),
            ));
        }
        TokenDigest::from_hex(&self.token_digest)
            .map_err(|e| ConfigError::ValidationError(format!("access.token_digest: {}", e)))
    }
}

/// Coordination backend settings
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinationConfig {
    /// Backend hosts, given as a list or a comma-separated string
    #[serde(deserialize_with = "comma_list")]
    pub hosts: Vec<String>,
    pub election_path: String,
    /// Parent of the per-repository buildset counters
    pub buildsets_path: String,
    pub session_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    #[serde(default)]
    pub reregister_backoff: BackoffConfig,
}

impl CoordinationConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Connection string for the ensemble, `host:port,host:port`.
    pub fn connect_string(&self) -> String {
        self.hosts.join(",")
    }
}

/// Message broker settings
#[derive(Debug, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub login: String,
    #[serde(deserialize_with = "secret")]
    pub password: SecretString,
    pub virtual_host: String,
    /// Topic exchange events are published to
    pub exchange: String,
    pub publish_retries: u32,
    #[serde(default)]
    pub publish_backoff: BackoffConfig,
    pub build_requests_queue: String,
    pub max_delivery_attempts: u32,
    pub dedup_capacity: usize,
}

impl BrokerConfig {
    /// AMQP URI including credentials. Never log the result.
    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            percent_encode(&self.login),
            percent_encode(self.password.expose_secret()),
            self.host,
            self.port,
            percent_encode(&self.virtual_host),
        )
    }
}

/// Percent-encode everything outside the URI unreserved set.
fn percent_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02x}", byte)),
        }
    }
    out
}

/// Outbound service endpoint (poller, secrets)
#[derive(Debug, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    #[serde(deserialize_with = "secret")]
    pub token: SecretString,
    pub uses_tls: bool,
    pub validate_cert: bool,
    /// PEM bundle of trusted roots, used instead of the web PKI roots
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    /// Overrides `timeouts.outbound_call_ms` for this endpoint
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
}

impl EndpointConfig {
    pub fn new(host: impl Into<String>, port: u16, token: &str) -> Self {
        Self {
            host: host.into(),
            port,
            token: SecretString::from(token.to_string()),
            uses_tls: false,
            validate_cert: true,
            ca_file: None,
            call_timeout_ms: None,
        }
    }

    pub fn with_tls(mut self, validate_cert: bool) -> Self {
        self.uses_tls = true;
        self.validate_cert = validate_cert;
        self
    }

    pub fn with_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn call_timeout(&self, timeouts: &TimeoutConfig) -> Duration {
        self.call_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| timeouts.outbound_call())
    }
}

/// Notification API settings
#[derive(Debug, Deserialize)]
pub struct NotificationConfig {
    /// Base URL; notifications are disabled when unset
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(deserialize_with = "secret")]
    pub api_token: SecretString,
}

impl MasterConfig {
    /// Check bounds that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::ValidationError(
                "server.port must be non-zero".to_string(),
            ));
        }
        if self.server.max_in_flight == 0 {
            return Err(ConfigError::ValidationError(
                "server.max_in_flight must be at least 1".to_string(),
            ));
        }
        if self.server.max_frame_bytes == 0
            || self.server.max_frame_bytes > buildmaster_protocol::MAX_FRAME_BYTES
        {
            return Err(ConfigError::ValidationError(format!(
                "server.max_frame_bytes must be in (0, {}]",
                buildmaster_protocol::MAX_FRAME_BYTES
            )));
        }
        if self.server.certfile.is_some() != self.server.keyfile.is_some() {
            return Err(ConfigError::ValidationError(
                "server.certfile and server.keyfile must be set together".to_string(),
            ));
        }

        self.access.digest()?;

        if self.coordination.hosts.is_empty() {
            return Err(ConfigError::ValidationError(
                "coordination.hosts must list at least one host".to_string(),
            ));
        }
        if !self.coordination.election_path.starts_with('/') {
            return Err(ConfigError::ValidationError(
                "coordination.election_path must be absolute".to_string(),
            ));
        }
        if !self.coordination.buildsets_path.starts_with('/')
            || self.coordination.buildsets_path.trim_end_matches('/')
                == self.coordination.election_path.trim_end_matches('/')
        {
            return Err(ConfigError::ValidationError(
                "coordination.buildsets_path must be absolute and differ from election_path".to_string(),
            ));
        }
        if self.coordination.heartbeat_interval_ms == 0
            || self.coordination.heartbeat_interval_ms >= self.coordination.session_timeout_ms
        {
            return Err(ConfigError::ValidationError(format!(
                "coordination.heartbeat_interval_ms must be in (0, {})",
                self.coordination.session_timeout_ms
            )));
        }

        if self.broker.publish_retries > MAX_PUBLISH_RETRIES {
            return Err(ConfigError::ValidationError(format!(
                "broker.publish_retries must be at most {}",
                MAX_PUBLISH_RETRIES
            )));
        }
        if self.broker.max_delivery_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "broker.max_delivery_attempts must be at least 1".to_string(),
            ));
        }
        if self.broker.dedup_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "broker.dedup_capacity must be at least 1".to_string(),
            ));
        }

        for (name, endpoint) in self.endpoints() {
            if endpoint.port == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{}.port must be non-zero",
                    name
                )));
            }
            if endpoint.ca_file.is_some() && !(endpoint.uses_tls && endpoint.validate_cert) {
                return Err(ConfigError::ValidationError(format!(
                    "{}.ca_file requires uses_tls and validate_cert",
                    name
                )));
            }
            if endpoint.call_timeout_ms == Some(0) {
                return Err(ConfigError::ValidationError(format!(
                    "{}.call_timeout_ms must be non-zero",
                    name
                )));
            }
        }

        self.timeouts
            .validate()
            .map_err(|e| ConfigError::ValidationError(format!("timeouts.{}", e)))?;

        Ok(())
    }

    /// Outbound endpoints by section name.
    pub fn endpoints(&self) -> [(&'static str, &EndpointConfig); 2] {
        [("poller", &self.poller), ("secrets", &self.secrets)]
    }

    /// Endpoints that speak TLS but skip certificate validation.
    pub fn insecure_endpoints(&self) -> Vec<&'static str> {
        self.endpoints()
            .into_iter()
            .filter(|(_, e)| e.uses_tls && !e.validate_cert)
            .map(|(name, _)| name)
            .collect()
    }
}

fn secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

fn comma_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Hosts {
        Joined(String),
        List(Vec<String>),
    }

    let hosts = match Hosts::deserialize(deserializer)? {
        Hosts::Joined(joined) => joined.split(',').map(str::to_string).collect(),
        Hosts::List(list) => list,
    };
    Ok(hosts
        .into_iter()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .collect())
}
