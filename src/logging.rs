//! Tracing setup for hosts.

use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber with `RUST_LOG`-style filtering,
/// defaulting to `info`. Calling it twice is harmless.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
