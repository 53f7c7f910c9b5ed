//! Tracing bootstrap for the Roost server.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogFormat;

const DEFAULT_FILTER: &str = "info,roost_server=debug,roost_xmpp=debug";

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` overrides the default filter. `format` picks between
/// human-readable output for local runs and JSON lines for collectors.
pub fn init(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()?,
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()?,
    }

    tracing::info!(format = %format, "Telemetry initialized");
    Ok(())
}

/// Flush telemetry before exit.
pub fn shutdown() {
    tracing::info!("Telemetry shutdown complete");
}
