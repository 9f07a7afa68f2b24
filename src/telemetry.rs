//! Logging setup and span helpers.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// JSON lines, for log shippers.
    Json,
    /// Human-readable output.
    #[default]
    Pretty,
}

/// Install the global subscriber.
///
/// `RUST_LOG` selects levels (default `info`). Later calls are no-ops, and
/// an already-installed subscriber (e.g. from a test harness) is left alone.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let result = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer())
                .try_init(),
        };
        if let Err(e) = result {
            eprintln!("logging already initialised: {}", e);
        }
    });
}

/// Span covering one accepted connection.
#[must_use]
pub fn connection_span(peer: &str, tls: bool) -> Span {
    tracing::info_span!("connection", peer = peer, tls = tls)
}

/// Span covering one dispatched command.
#[must_use]
pub fn command_span(command: &str, correlation_id: &str) -> Span {
    tracing::info_span!("command", command = command, correlation_id = correlation_id)
}
