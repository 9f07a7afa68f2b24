//! `send-email`: queued on the notification dispatcher.

use async_trait::async_trait;
use buildmaster_protocol::ops::{names, SendEmailArgs};
use serde_json::{json, Value};

use super::{parse_args, CommandError, CommandHandler, HandlerContext};

pub struct SendEmail;

#[async_trait]
impl CommandHandler for SendEmail {
    fn name(&self) -> &'static str {
        names::SEND_EMAIL
    }

    async fn handle(&self, ctx: &HandlerContext, args: Value) -> Result<Value, CommandError> {
        let args: SendEmailArgs = parse_args(args)?;
        if args.recipients.is_empty() {
            return Err(CommandError::InvalidArgs("recipients must not be empty".to_string()));
        }
        // Delivery happens in the background; a disabled dispatcher drops it.
        ctx.notifier().send_email(args.recipients, args.subject, args.message);
        Ok(json!({ "queued": true }))
    }
}
