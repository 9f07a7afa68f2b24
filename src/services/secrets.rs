//! Secrets service client.
//!
//! Values pass through in memory only; nothing here logs them.

use std::collections::BTreeMap;
use std::sync::Arc;

use buildmaster_protocol::ops::{actions, SecretEntry};
use serde_json::{json, Value};

use super::{CallRequest, ServiceError, Transport};

#[derive(Clone)]
pub struct SecretsClient {
    transport: Arc<dyn Transport>,
}

impl SecretsClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub async fn add_or_update_secret(&self, owner: &str, key: &str, value: &str) -> Result<Value, ServiceError> {
        tracing::debug!(owner, key, "storing secret");
        let body = json!({ "owner": owner, "key": key, "value": value });
        self.transport
            .call(&CallRequest::new(actions::ADD_OR_UPDATE_SECRET, body))
            .await
    }

    pub async fn remove_secret(&self, owner: &str, key: &str) -> Result<Value, ServiceError> {
        let body = json!({ "owner": owner, "key": key });
        self.transport.call(&CallRequest::new(actions::REMOVE_SECRET, body)).await
    }

    /// Secrets for every owner in `owners`, keyed by secret name. When two
    /// owners hold the same key, the later entry wins.
    pub async fn get_secrets(&self, owners: &[String]) -> Result<BTreeMap<String, String>, ServiceError> {
        let body = json!({ "owners": owners });
        let reply = self.transport.call(&CallRequest::new(actions::GET_SECRETS, body)).await?;

        let entries: Vec<SecretEntry> = serde_json::from_value(reply).map_err(|e| ServiceError::Protocol {
            endpoint: self.transport.endpoint().to_string(),
            message: format!("unexpected get-secrets reply: {}", e),
        })?;
        Ok(entries.into_iter().map(|entry| (entry.key, entry.value)).collect())
    }

    pub async fn remove_all(&self, owner: &str) -> Result<Value, ServiceError> {
        let body = json!({ "owner": owner });
        self.transport.call(&CallRequest::new(actions::REMOVE_ALL, body)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::MockTransport;

    #[tokio::test]
    async fn test_get_secrets_flattens_entries() {
        let mock = Arc::new(MockTransport::new());
        mock.reply(
            "get-secrets",
            json!([
                {"key": "API_KEY", "value": "one"},
                {"key": "DB_PASS", "value": "two"},
                {"key": "API_KEY", "value": "three"}
            ]),
        );
        let client = SecretsClient::new(mock.clone());

        let secrets = client.get_secrets(&["repo-1".to_string(), "org-1".to_string()]).await.unwrap();
        assert_eq!(secrets.len(), 2);
        assert_eq!(secrets["API_KEY"], "three");
        assert_eq!(secrets["DB_PASS"], "two");
        assert_eq!(mock.calls()[0].body["owners"], json!(["repo-1", "org-1"]));
    }

    #[tokio::test]
    async fn test_get_secrets_rejects_malformed_reply() {
        let mock = Arc::new(MockTransport::new());
        mock.reply("get-secrets", json!({"not": "a list"}));
        let client = SecretsClient::new(mock);

        let err = client.get_secrets(&["o".to_string()]).await.unwrap_err();
        assert!(matches!(err, ServiceError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_actions_and_bodies() {
        let mock = Arc::new(MockTransport::new());
        let client = SecretsClient::new(mock.clone());

        client.add_or_update_secret("o", "K", "v").await.unwrap();
        client.remove_secret("o", "K").await.unwrap();
        client.remove_all("o").await.unwrap();

        let actions: Vec<String> = mock.calls().into_iter().map(|c| c.action).collect();
        assert_eq!(actions, vec!["add-or-update-secret", "remove-secret", "remove-all"]);
    }
}
