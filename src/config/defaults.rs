//! Built-in master defaults (layer 1)
//!
//! Hardcoded defaults for every configuration section. The file and
//! environment layers override individual keys on top of this.

use serde::{Deserialize, Serialize};

use crate::retry::BackoffConfig;
use crate::timeout::TimeoutConfig;

/// Default RPC port
pub const DEFAULT_PORT: u16 = 1111;

/// Default frame ceiling (16 MiB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Built-in default configuration values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinDefaults {
    /// Listen address (default: "0.0.0.0")
    pub bind: String,

    /// Listen port (default: 1111)
    pub port: u16,

    /// Concurrent requests per connection (default: 32)
    pub max_in_flight: usize,

    /// Largest accepted frame payload
    pub max_frame_bytes: usize,

    /// Coordination hosts (default: "localhost:2181")
    pub coordination_hosts: String,

    /// Election node parent (default: "/buildmaster/election")
    pub election_path: String,

    /// Coordination session timeout in ms (default: 10000)
    pub session_timeout_ms: u64,

    /// Interval between coordination heartbeats in ms (default: 1000)
    pub heartbeat_interval_ms: u64,

    /// Broker port (default: 5672)
    pub broker_port: u16,

    /// Retries after a failed publish (default: 3)
    pub publish_retries: u32,

    /// Inbound build request queue (default: "build-requests")
    pub build_requests_queue: String,

    /// Deliveries before a message is dead-lettered (default: 5)
    pub max_delivery_attempts: u32,

    /// Remembered event ids for duplicate suppression (default: 10000)
    pub dedup_capacity: usize,

    /// Poller port (default: 9911)
    pub poller_port: u16,

    /// Secrets service port (default: 9745)
    pub secrets_port: u16,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_in_flight: 32,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            coordination_hosts: "localhost:2181".to_string(),
            election_path: "/buildmaster/election".to_string(),
            session_timeout_ms: 10_000,
            heartbeat_interval_ms: 1_000,
            broker_port: 5672,
            publish_retries: 3,
            build_requests_queue: "build-requests".to_string(),
            max_delivery_attempts: 5,
            dedup_capacity: 10_000,
            poller_port: 9911,
            secrets_port: 9745,
        }
    }
}

impl BuiltinDefaults {
    /// Convert to JSON Value for merging
    pub fn to_value(&self) -> serde_json::Value {
        let backoff = BackoffConfig::default();
        serde_json::json!({
            "instance_id": "",
            "server": {
                "bind": self.bind,
                "port": self.port,
                "max_in_flight": self.max_in_flight,
                "max_frame_bytes": self.max_frame_bytes
            },
            "access": {
                "token_digest": ""
            },
            "coordination": {
                "hosts": self.coordination_hosts,
                "election_path": self.election_path,
                "buildsets_path": "/buildmaster/buildsets",
                "session_timeout_ms": self.session_timeout_ms,
                "heartbeat_interval_ms": self.heartbeat_interval_ms,
                "reregister_backoff": backoff
            },
            "broker": {
                "host": "localhost",
                "port": self.broker_port,
                "login": "guest",
                "password": "guest",
                "virtual_host": "/",
                "exchange": "buildmaster",
                "publish_retries": self.publish_retries,
                "publish_backoff": backoff,
                "build_requests_queue": self.build_requests_queue,
                "max_delivery_attempts": self.max_delivery_attempts,
                "dedup_capacity": self.dedup_capacity
            },
            "poller": {
                "host": "localhost",
                "port": self.poller_port,
                "token": "",
                "uses_tls": false,
                "validate_cert": true
            },
            "secrets": {
                "host": "localhost",
                "port": self.secrets_port,
                "token": "",
                "uses_tls": false,
                "validate_cert": true
            },
            "notifications": {
                "api_token": ""
            },
            "timeouts": TimeoutConfig::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let defaults = BuiltinDefaults::default();
        assert_eq!(defaults.port, 1111);
        assert_eq!(defaults.max_frame_bytes, 16 * 1024 * 1024);
        assert_eq!(defaults.build_requests_queue, "build-requests");
        assert_eq!(defaults.publish_retries, 3);
    }

    #[test]
    fn test_to_value() {
        let value = BuiltinDefaults::default().to_value();

        assert_eq!(value["server"]["port"], 1111);
        assert_eq!(value["coordination"]["election_path"], "/buildmaster/election");
        assert_eq!(value["coordination"]["buildsets_path"], "/buildmaster/buildsets");
        assert_eq!(value["broker"]["exchange"], "buildmaster");
        assert_eq!(value["poller"]["validate_cert"], true);
        assert_eq!(value["timeouts"]["auth_ms"], 10_000);
        assert!(value["notifications"].get("api_url").is_none());
    }
}
