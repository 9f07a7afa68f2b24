//! Secrets service passthrough commands.
//!
//! Writes run detached so a dropped connection cannot leave a half-applied
//! change behind.

use async_trait::async_trait;
use buildmaster_protocol::ops::{names, AddOrUpdateSecretArgs, GetSecretsArgs, RemoveAllSecretsArgs, RemoveSecretArgs};
use serde_json::{json, Value};

use super::{parse_args, CommandError, CommandHandler, HandlerContext};

const SERVICE: &str = "secrets";

pub struct AddOrUpdateSecret;

#[async_trait]
impl CommandHandler for AddOrUpdateSecret {
    fn name(&self) -> &'static str {
        names::ADD_OR_UPDATE_SECRET
    }

    async fn handle(&self, ctx: &HandlerContext, args: Value) -> Result<Value, CommandError> {
        let args: AddOrUpdateSecretArgs = parse_args(args)?;
        let client = ctx.services().secrets.clone();
        ctx.detached(async move { client.add_or_update_secret(&args.owner, &args.key, &args.value).await })
            .await?
            .map_err(CommandError::service(SERVICE))
    }
}

pub struct RemoveSecret;

#[async_trait]
impl CommandHandler for RemoveSecret {
    fn name(&self) -> &'static str {
        names::REMOVE_SECRET
    }

    async fn handle(&self, ctx: &HandlerContext, args: Value) -> Result<Value, CommandError> {
        let args: RemoveSecretArgs = parse_args(args)?;
        let client = ctx.services().secrets.clone();
        ctx.detached(async move { client.remove_secret(&args.owner, &args.key).await })
            .await?
            .map_err(CommandError::service(SERVICE))
    }
}

pub struct GetSecrets;

#[async_trait]
impl CommandHandler for GetSecrets {
    fn name(&self) -> &'static str {
        names::GET_SECRETS
    }

    async fn handle(&self, ctx: &HandlerContext, args: Value) -> Result<Value, CommandError> {
        let args: GetSecretsArgs = parse_args(args)?;
        let secrets = ctx
            .services()
            .secrets
            .get_secrets(&args.owners)
            .await
            .map_err(CommandError::service(SERVICE))?;
        Ok(json!({ "secrets": secrets }))
    }
}

pub struct RemoveAllSecrets;

#[async_trait]
impl CommandHandler for RemoveAllSecrets {
    fn name(&self) -> &'static str {
        names::REMOVE_ALL_SECRETS
    }

    async fn handle(&self, ctx: &HandlerContext, args: Value) -> Result<Value, CommandError> {
        let args: RemoveAllSecretsArgs = parse_args(args)?;
        let client = ctx.services().secrets.clone();
        ctx.detached(async move { client.remove_all(&args.owner).await })
            .await?
            .map_err(CommandError::service(SERVICE))
    }
}
