//! `tracing` subscriber initialization.

use std::sync::Once;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

static INIT_TEST_TRACING: Once = Once::new();

/// Initializes the global tracing subscriber for a binary.
///
/// Respects `RUST_LOG`; defaults to `info` when unset. Panics if a global
/// subscriber is already installed, which is a programming error in `main`.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Initializes tracing for tests.
///
/// Safe to call from every test; the subscriber is installed once and
/// writes through the test harness capture.
pub fn init_test_tracing() {
    INIT_TEST_TRACING.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}
