//! buildmaster - master coordination node for a distributed build platform
//!
//! Accepts authenticated commands over a framed JSON socket interface, takes
//! part in leader election so exactly one instance schedules builds, publishes
//! build lifecycle events to a message broker, and calls out to the poller
//! and secrets services.

pub mod auth;
pub mod bus;
pub mod config;
pub mod coordination;
pub mod master;
pub mod notify;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod services;
pub mod telemetry;
pub mod timeout;

pub use auth::{CredentialVerifier, TokenDigest};
pub use config::{EffectiveConfig, MasterConfig};
pub use coordination::{Role, RoleHandle};
pub use master::{Backends, Master, MasterError};
