//! Poller service client.

use std::sync::Arc;

use buildmaster_protocol::ops::{actions, PollRepoArgs};
use serde_json::Value;

use super::{CallRequest, ServiceError, Transport};

#[derive(Clone)]
pub struct PollerClient {
    transport: Arc<dyn Transport>,
}

impl PollerClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Ask the poller to check a repository for new revisions.
    pub async fn poll(&self, args: &PollRepoArgs) -> Result<Value, ServiceError> {
        let body = serde_json::to_value(args).map_err(|e| ServiceError::Protocol {
            endpoint: self.transport.endpoint().to_string(),
            message: e.to_string(),
        })?;
        tracing::debug!(repo_id = %args.repo_id, "polling repository");
        self.transport.call(&CallRequest::new(actions::POLL, body)).await
    }
}
