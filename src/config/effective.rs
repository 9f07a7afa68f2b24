//! Effective configuration with provenance
//!
//! Layers are merged in order (built-in defaults, TOML file, environment)
//! and the result is recorded together with where each layer came from.
//! The recorded copy is redacted; the typed `MasterConfig` is built from
//! the unredacted merge and never serialized back out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

use super::defaults::BuiltinDefaults;
use super::merge::{merge_layers, nest};
use super::settings::MasterConfig;

/// Schema version for effective_config
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier
pub const SCHEMA_ID: &str = "buildmaster/effective_config@1";

/// Prefix for environment overrides: `BUILDMASTER__<SECTION>__<KEY>`
pub const ENV_PREFIX: &str = "BUILDMASTER__";

/// Origin of a configuration source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    File,
    Env,
}

/// A contributing config source with provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    /// File path (file layer only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// SHA-256 digest of raw file bytes (file layer only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    /// Overridden key paths (env layer only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,
}

/// Effective configuration with provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub schema_version: u32,
    pub schema_id: String,

    /// When this config was computed
    pub created_at: DateTime<Utc>,

    /// The merged configuration object, secrets redacted
    pub config: Value,

    /// Contributing sources in precedence order
    pub sources: Vec<ConfigSource>,

    /// Redacted key paths
    pub redactions: Vec<String>,
}

/// Typed configuration plus its redacted provenance record.
#[derive(Debug)]
pub struct LoadedConfig {
    pub config: MasterConfig,
    pub effective: EffectiveConfig,
}

/// Keys that contain secrets and should be redacted
const SECRET_KEYS: &[&str] = &["password", "token", "secret", "private_key", "api_key", "credential"];

impl EffectiveConfig {
    /// Load, merge, type and validate the configuration.
    ///
    /// `env` is usually `std::env::vars()`; only `BUILDMASTER__` keys are used.
    pub fn load<I>(config_path: Option<&Path>, env: I) -> Result<LoadedConfig, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut layers = Vec::new();
        let mut sources = Vec::new();

        // Layer 1: Built-in defaults
        layers.push(BuiltinDefaults::default().to_value());
        sources.push(ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
            keys: Vec::new(),
        });

        // Layer 2: Config file
        if let Some(path) = config_path {
            let (value, digest) = Self::load_toml_file(path)?;
            layers.push(value);
            sources.push(ConfigSource {
                origin: ConfigOrigin::File,
                path: Some(path.to_string_lossy().to_string()),
                digest: Some(digest),
                keys: Vec::new(),
            });
        }

        // Layer 3: Environment
        let (env_layers, keys) = Self::env_overrides(env);
        if !keys.is_empty() {
            layers.extend(env_layers);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Env,
                path: None,
                digest: None,
                keys,
            });
        }

        let mut merged = merge_layers(layers);

        let mut config: MasterConfig = serde_json::from_value(merged.clone())
            .map_err(|e| ConfigError::ParseError(format!("invalid configuration: {}", e)))?;
        if config.instance_id.trim().is_empty() {
            config.instance_id = uuid::Uuid::new_v4().to_string();
            if let Value::Object(map) = &mut merged {
                map.insert("instance_id".to_string(), Value::String(config.instance_id.clone()));
            }
        }
        config.validate()?;

        let redactions = Self::redact_secrets(&mut merged);

        Ok(LoadedConfig {
            config,
            effective: Self {
                schema_version: SCHEMA_VERSION,
                schema_id: SCHEMA_ID.to_string(),
                created_at: Utc::now(),
                config: merged,
                sources,
                redactions,
            },
        })
    }

    /// Load and parse a TOML file, returning the value and digest
    fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
        let bytes = fs::read(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hex::encode(hasher.finalize());

        let contents = String::from_utf8(bytes)
            .map_err(|e| ConfigError::ParseError(format!("Invalid UTF-8: {}", e)))?;

        let toml_value: toml::Value = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(format!("TOML parse error: {}", e)))?;

        Ok((Self::toml_to_json(toml_value), digest))
    }

    /// Turn `BUILDMASTER__SECTION__KEY=value` pairs into nested layers.
    ///
    /// Values parse as TOML scalars (`5673`, `true`) when they can, except
    /// for secret-like keys, which always stay strings.
    fn env_overrides<I>(env: I) -> (Vec<Value>, Vec<String>)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut vars: Vec<(String, String)> = env
            .into_iter()
            .filter(|(key, _)| key.starts_with(ENV_PREFIX))
            .collect();
        vars.sort();

        let mut layers = Vec::new();
        let mut keys = Vec::new();
        for (key, raw) in vars {
            let path: Vec<String> = key[ENV_PREFIX.len()..]
                .split("__")
                .filter(|segment| !segment.is_empty())
                .map(str::to_lowercase)
                .collect();
            let Some(leaf) = path.last() else {
                continue;
            };

            let value = if Self::is_secret_key(leaf) {
                Value::String(raw)
            } else {
                Self::parse_scalar(&raw)
            };
            keys.push(path.join("."));
            layers.push(nest(&path, value));
        }
        (layers, keys)
    }

    fn parse_scalar(raw: &str) -> Value {
        match toml::from_str::<toml::Table>(&format!("v = {}", raw)) {
            Ok(mut table) => match table.remove("v") {
                Some(value @ (toml::Value::Integer(_) | toml::Value::Boolean(_) | toml::Value::Float(_))) => {
                    Self::toml_to_json(value)
                }
                Some(value @ toml::Value::Array(_)) => Self::toml_to_json(value),
                _ => Value::String(raw.to_string()),
            },
            Err(_) => Value::String(raw.to_string()),
        }
    }

    /// Convert TOML Value to JSON Value
    fn toml_to_json(toml: toml::Value) -> Value {
        match toml {
            toml::Value::String(s) => Value::String(s),
            toml::Value::Integer(i) => Value::Number(i.into()),
            toml::Value::Float(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            toml::Value::Boolean(b) => Value::Bool(b),
            toml::Value::Datetime(dt) => Value::String(dt.to_string()),
            toml::Value::Array(arr) => Value::Array(arr.into_iter().map(Self::toml_to_json).collect()),
            toml::Value::Table(table) => Value::Object(
                table
                    .into_iter()
                    .map(|(k, v)| (k, Self::toml_to_json(v)))
                    .collect(),
            ),
        }
    }

    fn is_secret_key(key: &str) -> bool {
        let key_lower = key.to_lowercase();
        SECRET_KEYS.iter().any(|s| key_lower.contains(s))
    }

    /// Redact secrets in the config, returning list of redacted paths
    fn redact_secrets(value: &mut Value) -> Vec<String> {
        let mut redactions = Vec::new();
        Self::redact_recursive(value, String::new(), &mut redactions);
        redactions
    }

    fn redact_recursive(value: &mut Value, path: String, redactions: &mut Vec<String>) {
        match value {
            Value::Object(map) => {
                for (key, val) in map.iter_mut() {
                    let current_path = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", path, key)
                    };

                    if Self::is_secret_key(key) && !val.is_object() && !val.is_array() {
                        *val = Value::String("[REDACTED]".to_string());
                        redactions.push(current_path);
                    } else {
                        Self::redact_recursive(val, current_path, redactions);
                    }
                }
            }
            Value::Array(arr) => {
                for (i, val) in arr.iter_mut().enumerate() {
                    Self::redact_recursive(val, format!("{}[{}]", path, i), redactions);
                }
            }
            _ => {}
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Get a config value by path (dot-separated)
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut current = &self.config;
        for part in path.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    pub fn get_u64(&self, path: &str) -> Option<u64> {
        self.get(path).and_then(|v| v.as_u64())
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(|v| v.as_str())
    }
}

impl MasterConfig {
    /// Load from an optional TOML file plus the process environment.
    pub fn load(config_path: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
        EffectiveConfig::load(config_path, std::env::vars())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
