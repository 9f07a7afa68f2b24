//! Timeout bounds for the master's network operations.
//!
//! Every operation that waits on a peer has its own deadline:
//! - `tls_handshake_ms`: inbound TLS handshake
//! - `auth_ms`: reading and verifying the credential frame
//! - `idle_connection_ms`: time a ready connection may stay silent
//! - `outbound_call_ms`: default deadline for poller/secrets calls
//! - `broker_publish_ms`: one publish round trip to the broker
//! - `coordination_ping_ms`: one heartbeat to the coordination backend
//! - `notification_ms`: one POST to the notification endpoint
//!
//! Exceeding a deadline is reported as a failure of that operation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Upper bound accepted for any configured timeout (1 hour).
const MAX_TIMEOUT_MS: u64 = 3_600_000;

/// Timeout configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub tls_handshake_ms: u64,
    pub auth_ms: u64,
    pub idle_connection_ms: u64,
    pub outbound_call_ms: u64,
    pub broker_publish_ms: u64,
    pub coordination_ping_ms: u64,
    pub notification_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            tls_handshake_ms: 10_000,
            auth_ms: 10_000,
            idle_connection_ms: 300_000,
            outbound_call_ms: 30_000,
            broker_publish_ms: 5_000,
            coordination_ping_ms: 3_000,
            notification_ms: 10_000,
        }
    }
}

impl TimeoutConfig {
    /// Validate that every bound is in (0, 1h]
    pub fn validate(&self) -> Result<(), TimeoutValidationError> {
        let fields = [
            ("tls_handshake_ms", self.tls_handshake_ms),
            ("auth_ms", self.auth_ms),
            ("idle_connection_ms", self.idle_connection_ms),
            ("outbound_call_ms", self.outbound_call_ms),
            ("broker_publish_ms", self.broker_publish_ms),
            ("coordination_ping_ms", self.coordination_ping_ms),
            ("notification_ms", self.notification_ms),
        ];

        for (field, value) in fields {
            if value == 0 || value > MAX_TIMEOUT_MS {
                return Err(TimeoutValidationError::OutOfBounds {
                    field,
                    value,
                    max: MAX_TIMEOUT_MS,
                });
            }
        }

        Ok(())
    }

    pub fn tls_handshake(&self) -> Duration {
        Duration::from_millis(self.tls_handshake_ms)
    }

    pub fn auth(&self) -> Duration {
        Duration::from_millis(self.auth_ms)
    }

    pub fn idle_connection(&self) -> Duration {
        Duration::from_millis(self.idle_connection_ms)
    }

    pub fn outbound_call(&self) -> Duration {
        Duration::from_millis(self.outbound_call_ms)
    }

    pub fn broker_publish(&self) -> Duration {
        Duration::from_millis(self.broker_publish_ms)
    }

    pub fn coordination_ping(&self) -> Duration {
        Duration::from_millis(self.coordination_ping_ms)
    }

    pub fn notification(&self) -> Duration {
        Duration::from_millis(self.notification_ms)
    }
}

/// Timeout validation errors
#[derive(Debug, thiserror::Error)]
pub enum TimeoutValidationError {
    #[error("{field} must be in (0, {max}], got {value}")]
    OutOfBounds {
        field: &'static str,
        value: u64,
        max: u64,
    },
}
