//! Console subscriber for binaries and local runs.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, thiserror::Error)]
#[error("Failed to init subscriber: {0}")]
pub struct SubscriberError(String);

/// Installs a global fmt subscriber filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() -> Result<(), SubscriberError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| SubscriberError(e.to_string()))
}
