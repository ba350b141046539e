//! Logging facade. The engine itself never installs a subscriber — that
//! is the embedding application's call, the same way the teacher's
//! `log_utils::start_logger` is invoked once from `main.rs` rather than
//! from any of the modules that call `log::debug!`/`log::warn!`.
//!
//! `TimeLogger` is kept as-is for the same ad-hoc benchmarking use the
//! teacher puts it to (bracketing a slow block and logging its wall
//! time at `debug` level); `init_test_logger` is the test-only
//! equivalent of `start_logger`, using the same `flexi_logger` crate but
//! writing to stderr instead of a rotated file, since tests have no
//! profile directory to log into.

use std::time::Instant;

/// Brackets a block of code and logs its wall-clock duration at `debug`
/// level on drop-free `log()` call, grounded on
/// `utils::log_utils::TimeLogger`.
pub struct TimeLogger {
    label: &'static str,
    start: Instant,
}

impl TimeLogger {
    pub fn start(label: &'static str) -> Self {
        Self { label, start: Instant::now() }
    }

    pub fn log(self) {
        let elapsed = self.start.elapsed().as_secs_f64();
        log::debug!("BENCH {} time = {:.6} s", self.label, elapsed);
    }
}

/// Installs a stderr logger for test binaries. Safe to call more than
/// once per process (later calls are ignored); tests that want to see
/// `log::` output should call this at the top of the test body.
#[cfg(test)]
pub fn init_test_logger() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = flexi_logger::Logger::try_with_str("debug").and_then(|l| l.start());
    });
}
