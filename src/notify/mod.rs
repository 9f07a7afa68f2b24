//! Notification Dispatcher
//!
//! Fire-and-forget HTTP posts to the notification service. Delivery never
//! blocks or fails the caller: each post runs in its own task, bounded by the
//! notification timeout, and failures are logged and dropped.

use std::time::Duration;

use buildmaster_protocol::ops::{SendEmailArgs, StatusUpdate};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::NotificationConfig;

const BUILD_STATUS_PATH: &str = "build-status";
const SEND_EMAIL_PATH: &str = "send-email";

/// Delivery failures. Only ever logged.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("notification endpoint answered {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    client: reqwest::Client,
    api_url: Option<String>,
    token: SecretString,
}

impl NotificationDispatcher {
    pub fn new(config: &NotificationConfig, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_url: config
                .api_url
                .as_ref()
                .map(|url| url.trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty()),
            token: SecretString::from(config.api_token.expose_secret().to_string()),
        }
    }

    /// A dispatcher that drops everything.
    pub fn disabled() -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: None,
            token: SecretString::from(String::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_url.is_some()
    }

    /// Post a build status update in the background.
    pub fn notify(&self, update: StatusUpdate) -> Option<JoinHandle<()>> {
        tracing::debug!(event_type = %update.event_type, repository_id = %update.repository_id, "status notification");
        self.spawn(BUILD_STATUS_PATH, update)
    }

    /// Ask the notification service to send an email, in the background.
    pub fn send_email(&self, recipients: Vec<String>, subject: String, message: String) -> Option<JoinHandle<()>> {
        self.spawn(
            SEND_EMAIL_PATH,
            SendEmailArgs {
                recipients,
                subject,
                message,
            },
        )
    }

    fn spawn<T: Serialize>(&self, path: &'static str, payload: T) -> Option<JoinHandle<()>> {
        let Some(base) = &self.api_url else {
            tracing::debug!(path, "notifications disabled, dropping");
            return None;
        };
        let payload = match serde_json::to_value(&payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(path, error = %e, "notification payload not serializable");
                return None;
            }
        };
        let url = format!("{}/{}", base, path);
        let this = self.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = this.deliver(&url, &payload).await {
                tracing::warn!(url = %url, error = %e, "notification delivery failed");
            }
        }))
    }

    async fn deliver(&self, url: &str, payload: &Value) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(self.token.expose_secret())
            .json(payload)
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(NotifyError::Status { status, body })
    }
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("api_url", &self.api_url)
            .finish_non_exhaustive()
    }
}
