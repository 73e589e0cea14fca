//! Global `tracing` logger for the admin scripts.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    filter::Targets,
    layer::{Layer, SubscriberExt},
    util::{SubscriberInitExt, TryInitError},
};

/// Initialize a global `tracing` logger.
///
/// + Prints enabled events and spans to stderr, keeping stdout free for
///   report output.
/// + The default log level includes INFO, WARN, and ERROR events.
/// + Change the level or module filtering with a `RUST_LOG` env var.
///
/// Panics if a logger is already initialized.
pub fn init() {
    try_init().expect("Failed to setup logger");
}

/// Try to initialize a global logger. Returns an `Err` if another global
/// logger is already set.
pub fn try_init() -> Result<(), TryInitError> {
    // Defaults to INFO if no `RUST_LOG` is set or it doesn't parse.
    let rust_log_filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|rust_log| Targets::from_str(&rust_log).ok())
        .unwrap_or_else(|| Targets::new().with_default(Level::INFO));

    let stderr_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_level(true)
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_filter(rust_log_filter);

    tracing_subscriber::registry().with(stderr_log).try_init()
}
