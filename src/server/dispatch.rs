//! Command dispatcher.
//!
//! Routes an authenticated request to its handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use buildmaster_protocol::{Request, Response, RpcError};
use tracing::Instrument;

use super::handlers::{default_handlers, CommandError, CommandHandler, HandlerContext};
use crate::telemetry::command_span;

/// Command registry plus a count of handler invocations.
pub struct Dispatcher {
    handlers: HashMap<&'static str, Arc<dyn CommandHandler>>,
    dispatched: AtomicU64,
}

impl Dispatcher {
    pub fn new(handlers: Vec<Arc<dyn CommandHandler>>) -> Self {
        Self {
            handlers: handlers.into_iter().map(|h| (h.name(), h)).collect(),
            dispatched: AtomicU64::new(0),
        }
    }

    /// Number of requests that reached a handler.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Dispatch one request. Never fails; errors become error responses.
    pub async fn dispatch(&self, ctx: &HandlerContext, request: Request) -> Response {
        let Request { id, command, args } = request;
        let span = command_span(&command, &id);

        let result = async {
            if command == buildmaster_protocol::ops::names::AUTHENTICATE {
                return Err(RpcError::invalid_request("connection is already authenticated"));
            }
            let handler = self
                .handlers
                .get(command.as_str())
                .ok_or_else(|| RpcError::unknown_command(&command))?;

            if handler.requires_leader() {
                let role = ctx.role().current();
                if !ctx.role().is_leader() {
                    tracing::debug!(role = %role, "leader-only command refused");
                    return Err(CommandError::NotLeader(role).to_rpc_error());
                }
            }

            self.dispatched.fetch_add(1, Ordering::Relaxed);
            handler.handle(ctx, args).await.map_err(|e| {
                tracing::warn!(error = %e, "command failed");
                e.to_rpc_error()
            })
        }
        .instrument(span)
        .await;

        match result {
            Ok(body) => Response::success(id, body),
            Err(error) => Response::error(id, error),
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(default_handlers())
    }
}
