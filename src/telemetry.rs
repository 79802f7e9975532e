// phantom-dspm-core/src/telemetry.rs
// Structured logging init. A consuming binary may install its own
// subscriber instead; this is a convenience for standalone use and tests.

use tracing_subscriber::EnvFilter;

/// Installs a `tracing` subscriber reading filter directives from
/// `RUST_LOG`, defaulting to `info`. Safe to call more than once; later
/// calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
