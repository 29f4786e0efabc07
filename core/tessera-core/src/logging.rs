//! Tracing setup for embedding applications and tests.
//!
//! The engine itself only emits `tracing` events; nothing is printed unless
//! the host installs a subscriber. With the `logging` feature enabled these
//! helpers install a `fmt` subscriber whose filter comes from
//! `TESSERA_LOG`, then `RUST_LOG`, then the given default. Merge spans are
//! reported on close so flush timings show up in the log.

#[cfg(feature = "logging")]
use tracing_subscriber::{EnvFilter, fmt, fmt::format::FmtSpan};

#[cfg(feature = "logging")]
const FILTER_ENV: &str = "TESSERA_LOG";

#[cfg(feature = "logging")]
fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_env(FILTER_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(format!("tessera_core={default_level},sled=warn")))
}

/// Install a subscriber at `info` for this crate and `warn` for sled.
///
/// ```rust
/// tessera_core::logging::init();
/// ```
#[cfg(feature = "logging")]
pub fn init() {
    init_with_level("info")
}

/// Like [`init`] with another default level for this crate. Calling it
/// after a subscriber is installed does nothing.
#[cfg(feature = "logging")]
pub fn init_with_level(level: &str) {
    let _ = fmt()
        .with_env_filter(filter(level))
        .with_span_events(FmtSpan::CLOSE)
        .with_thread_names(true)
        .try_init();
}

#[cfg(feature = "logging")]
pub fn init_test() {
    let _ = fmt()
        .with_env_filter(filter("debug"))
        .with_span_events(FmtSpan::CLOSE)
        .with_test_writer()
        .try_init();
}

#[cfg(not(feature = "logging"))]
pub fn init() {}

#[cfg(not(feature = "logging"))]
pub fn init_with_level(_level: &str) {}

#[cfg(not(feature = "logging"))]
pub fn init_test() {}
