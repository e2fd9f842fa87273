use std::sync::Once;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// Logs go through `with_test_writer()`, so they only show up for failing
/// tests unless run with `-- --nocapture`. Levels come from `RUST_LOG`.
#[allow(dead_code)]
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// Path to the compiled `brood` binary.
#[allow(dead_code)]
pub fn brood_bin() -> &'static str {
    env!("CARGO_BIN_EXE_brood")
}
