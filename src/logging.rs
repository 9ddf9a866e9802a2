//! Logging initialization

use tracing_subscriber::EnvFilter;

use crate::errors::{PulsewireError, Result};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "pulsewire=info";

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to
/// [`DEFAULT_FILTER`]. Fails if a global subscriber is already set.
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    install(filter)
}

/// Install a fmt subscriber with an explicit filter directive
pub fn init_tracing_with_filter(directives: &str) -> Result<()> {
    let filter = EnvFilter::try_new(directives)
        .map_err(|e| PulsewireError::Config(format!("Invalid log filter '{}': {}", directives, e)))?;
    install(filter)
}

fn install(filter: EnvFilter) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false)
        .try_init()
        .map_err(|e| PulsewireError::Config(format!("Failed to install tracing subscriber: {}", e)))
}
