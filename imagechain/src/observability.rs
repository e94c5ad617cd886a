//! Tracing subscriber setup for binaries and tests that want log output.

use crate::errors::{ChainError, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs a global subscriber filtered by `RUST_LOG`, or `default_filter` if unset.
///
/// With `json` set, events are written as one JSON object per line.
///
/// # Errors
///
/// Returns `Configuration` if a global subscriber is already installed.
pub fn init_tracing(default_filter: &str, json: bool) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .try_init()
        .map_err(|e| ChainError::configuration(format!("cannot install tracing subscriber: {e}")))
}
