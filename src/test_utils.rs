//! Test logging helpers.
//!
//! Unit tests call [`init_test_logging`] and bracket themselves with
//! `test_phase!` / `test_complete!` so a failing run shows which phase
//! produced which log lines. `RUST_LOG` controls verbosity.

/// Installs a test-writer `tracing` subscriber once per process.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("eventport=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Marks the start of a test in the log.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST START ===");
    };
}

/// Marks the successful end of a test in the log.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST COMPLETE ===");
    };
}

/// Assertion that logs expected and actual values before failing.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        if !$cond {
            tracing::error!(
                message = $msg,
                expected = ?$expected,
                actual = ?$actual,
                "Assertion failed"
            );
        }
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}
