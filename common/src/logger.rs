//! Structured logging init, filtered by `RUST_LOG` and defaulting to `info`.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global `tracing` subscriber. Safe to call once at process
/// startup; panics if a subscriber is already installed.
pub fn init() {
    try_init().expect("failed to initialize logger")
}

pub fn try_init() -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .try_init()
}
