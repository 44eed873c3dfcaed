//! Tracing subscriber setup.
//!
//! `RUST_LOG` overrides the default directive, e.g.
//! `RUST_LOG=canasat_orchestration=debug,canasat_storage=info`.

use tracing_subscriber::EnvFilter;

/// Filter from `RUST_LOG`, falling back to `default_directive`.
pub fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install the global fmt subscriber.
///
/// Returns `false` when a subscriber was already installed (tests, embedding
/// applications); the existing one is kept.
pub fn init_tracing(default_directive: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_directive))
        .with_target(true)
        .try_init()
        .is_ok()
}
