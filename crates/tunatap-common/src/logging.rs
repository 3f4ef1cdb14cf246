//! Unified logging initialization for tunatap binaries.
//!
//! Respects, in priority order: CLI flags (`-v`/`-q`), then `RUST_LOG`, then
//! a binary-specific default filter.

use clap_verbosity_flag::{LogLevel, Verbosity};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize `tracing` with the given verbosity flags and default filter.
pub fn init_logging<L: LogLevel>(
    verbosity: &Verbosity<L>,
    base_filter: &str,
    default_filter: &str,
) -> anyhow::Result<()> {
    let filter = if verbosity.is_present() {
        EnvFilter::try_new(format!("{base_filter}={}", verbosity.log_level_filter()))?
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true).compact())
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}
