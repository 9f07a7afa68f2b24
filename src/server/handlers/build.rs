//! Build scheduling commands. Leader only.

use async_trait::async_trait;
use buildmaster_protocol::ops::{names, CancelBuildArgs, ScheduleBuildArgs};
use serde_json::Value;

use super::{parse_args, to_body, CommandError, CommandHandler, HandlerContext};

pub struct ScheduleBuild;

#[async_trait]
impl CommandHandler for ScheduleBuild {
    fn name(&self) -> &'static str {
        names::SCHEDULE_BUILD
    }

    fn requires_leader(&self) -> bool {
        true
    }

    async fn handle(&self, ctx: &HandlerContext, args: Value) -> Result<Value, CommandError> {
        let args: ScheduleBuildArgs = parse_args(args)?;
        let scheduler = ctx.scheduler().clone();
        let ack = ctx.detached(async move { scheduler.schedule(&args).await }).await??;
        to_body(&ack)
    }
}

pub struct CancelBuild;

#[async_trait]
impl CommandHandler for CancelBuild {
    fn name(&self) -> &'static str {
        names::CANCEL_BUILD
    }

    fn requires_leader(&self) -> bool {
        true
    }

    async fn handle(&self, ctx: &HandlerContext, args: Value) -> Result<Value, CommandError> {
        let args: CancelBuildArgs = parse_args(args)?;
        let scheduler = ctx.scheduler().clone();
        let ack = ctx.detached(async move { scheduler.cancel(&args).await }).await??;
        to_body(&ack)
    }
}
