//! Buildmaster Protocol Types
//!
//! Defines the length-prefixed JSON envelope spoken by RPC clients of the
//! master node, and by the master when it calls the poller and secrets
//! services.

pub mod error;
pub mod frame;
pub mod ops;
pub mod request;
pub mod response;

pub use error::{ErrorCode, RpcError};
pub use frame::{decode_frame, decode_payload, encode_frame, FrameError, LENGTH_PREFIX_BYTES, MAX_FRAME_BYTES};
pub use request::{Request, ServiceRequest};
pub use response::Response;

/// Current master version string, reported by `healthcheck`.
pub const MASTER_VERSION: &str = env!("CARGO_PKG_VERSION");
