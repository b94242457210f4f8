//! Miscellaneous test code for Grevy.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::sync::Once;

use tracing_subscriber::EnvFilter;

pub mod net;

static INIT: Once = Once::new();

/// Initialize globals for tests, installing the tracing subscriber once.
///
/// Uses the `RUST_LOG` env var when set, and hides everything below `warn`
/// by default so failing tests stay readable.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_test_writer()
            .init();
    });
}
