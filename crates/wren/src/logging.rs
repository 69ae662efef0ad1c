//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events. Binaries and tests that want to
//! see them call [`init`] once; the filter comes from `RUST_LOG`, falling
//! back to `warn`.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "warn";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install a fmt subscriber filtered by `RUST_LOG`. Returns `false` if a
/// global subscriber was already installed, which is not an error.
pub fn init() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Like [`init`], writing through the test harness's captured output.
pub fn init_for_tests() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_test_writer()
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        let _ = init_for_tests();
        assert!(!init_for_tests());
    }
}
