//! Health and leadership status.

use async_trait::async_trait;
use buildmaster_protocol::ops::{names, HealthcheckReply, LeaderStatusReply};
use buildmaster_protocol::MASTER_VERSION;
use serde_json::Value;

use super::{to_body, CommandError, CommandHandler, HandlerContext};

pub struct Healthcheck;

#[async_trait]
impl CommandHandler for Healthcheck {
    fn name(&self) -> &'static str {
        names::HEALTHCHECK
    }

    async fn handle(&self, ctx: &HandlerContext, _args: Value) -> Result<Value, CommandError> {
        to_body(&HealthcheckReply {
            status: "ok".to_string(),
            role: ctx.role().current().to_string(),
            instance_id: ctx.instance_id().to_string(),
            version: MASTER_VERSION.to_string(),
        })
    }
}

pub struct LeaderStatus;

#[async_trait]
impl CommandHandler for LeaderStatus {
    fn name(&self) -> &'static str {
        names::LEADER_STATUS
    }

    async fn handle(&self, ctx: &HandlerContext, _args: Value) -> Result<Value, CommandError> {
        let membership = ctx.role().membership();
        to_body(&LeaderStatusReply {
            role: membership.role.to_string(),
            instance_id: ctx.instance_id().to_string(),
            node: membership.node,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::Role;
    use crate::server::handlers::testing;

    #[tokio::test]
    async fn test_healthcheck_reports_role() {
        let t = testing::context(Role::Follower);
        let body = Healthcheck.handle(&t.ctx, Value::Null).await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["role"], "follower");
        assert_eq!(body["instance_id"], "test-master");
    }

    #[tokio::test]
    async fn test_leader_status_without_node() {
        let t = testing::context(Role::Leader);
        let body = LeaderStatus.handle(&t.ctx, Value::Null).await.unwrap();
        assert_eq!(body["role"], "leader");
        assert!(body.get("node").is_none());
    }
}
