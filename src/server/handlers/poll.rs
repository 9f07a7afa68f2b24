//! Repository polling. Leader only.

use async_trait::async_trait;
use buildmaster_protocol::ops::{names, PollRepoArgs};
use serde_json::Value;

use super::{parse_args, CommandError, CommandHandler, HandlerContext};

pub struct PollRepo;

#[async_trait]
impl CommandHandler for PollRepo {
    fn name(&self) -> &'static str {
        names::POLL_REPO
    }

    fn requires_leader(&self) -> bool {
        true
    }

    async fn handle(&self, ctx: &HandlerContext, args: Value) -> Result<Value, CommandError> {
        let args: PollRepoArgs = parse_args(args)?;
        ctx.services()
            .poller
            .poll(&args)
            .await
            .map_err(CommandError::service("poller"))
    }
}
