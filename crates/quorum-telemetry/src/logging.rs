use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install the global tracing subscriber with the default `info` filter.
/// Safe to call more than once; later calls are no-ops, so tests and
/// binaries can both call it freely.
pub fn init() {
    init_with_filter("info");
}

/// Install the global tracing subscriber. `RUST_LOG` wins over
/// `default_filter` when set.
pub fn init_with_filter(default_filter: &str) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    });
}
