//! Master configuration
//!
//! Three layers merge into one immutable `MasterConfig`:
//! 1. Built-in defaults
//! 2. TOML config file (`--config`)
//! 3. Environment (`BUILDMASTER__<SECTION>__<KEY>`)

mod defaults;
mod effective;
mod merge;
mod settings;

pub use defaults::{BuiltinDefaults, DEFAULT_MAX_FRAME_BYTES, DEFAULT_PORT};
pub use effective::{ConfigError, ConfigOrigin, ConfigSource, EffectiveConfig, LoadedConfig, ENV_PREFIX};
pub use merge::{deep_merge, merge_layers};
pub use settings::{
    AccessConfig, BrokerConfig, CoordinationConfig, EndpointConfig, MasterConfig, NotificationConfig,
    ServerConfig,
};
