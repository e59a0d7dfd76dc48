//! Shared utilities for UKEY2: logging setup, constant-time helpers.
//!
//! This crate provides common infrastructure used by the protocol crates.

#![forbid(unsafe_code)]

pub mod helpers;

pub use helpers::constant_time_eq;

/// Initialize tracing with sensible defaults.
///
/// Log level is controlled by the `RUST_LOG` environment variable.
/// Defaults to `info` if not set.
pub fn init_tracing() {
    init_tracing_with_default("info");
}

/// Initialize tracing with a specific default level.
///
/// Safe to call more than once (later calls are ignored), so test
/// binaries can call it from every test.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_test_writer()
        .try_init();
}
