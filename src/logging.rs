//! `tracing` subscriber bootstrap. One call at the top of `main`; every
//! other module just uses `tracing::{info,warn,error,debug}!` directly.

use tracing_subscriber::EnvFilter;

/// Installs a process-wide subscriber reading `RUST_LOG` (default `info`).
/// Idempotent-by-construction: `main` calls this exactly once.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
