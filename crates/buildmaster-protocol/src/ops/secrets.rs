//! Secrets command types.
//!
//! Secret values travel in these payloads, so none of the types that hold a
//! value derive `Debug` with the value visible.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Arguments for `add-or-update-secret`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AddOrUpdateSecretArgs {
    /// Owner id (repository, user or organization).
    pub owner: String,
    pub key: String,
    pub value: String,
}

impl fmt::Debug for AddOrUpdateSecretArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddOrUpdateSecretArgs")
            .field("owner", &self.owner)
            .field("key", &self.key)
            .field("value", &"[REDACTED]")
            .finish()
    }
}

/// Arguments for `remove-secret`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveSecretArgs {
    pub owner: String,
    pub key: String,
}

/// Arguments for `get-secrets`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSecretsArgs {
    pub owners: Vec<String>,
}

/// Arguments for `remove-all-secrets`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveAllSecretsArgs {
    pub owner: String,
}

/// A secret as returned by the secrets service.
#[derive(Clone, Serialize, Deserialize)]
pub struct SecretEntry {
    pub key: String,
    pub value: String,
}

impl fmt::Debug for SecretEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretEntry")
            .field("key", &self.key)
            .field("value", &"[REDACTED]")
            .finish()
    }
}
