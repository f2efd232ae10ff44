//! Paired start/finish progress events.

use std::time::{Duration, Instant};

use tracing::info;

/// Logs `starting` when created and `finished` with the elapsed time when
/// dropped.
#[must_use = "the stage finishes as soon as it is dropped"]
pub struct Stage {
    label: String,
    started: Instant,
}

impl Stage {
    pub fn start(label: impl Into<String>) -> Self {
        let label = label.into();
        info!(stage = %label, "starting");
        Self {
            label,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        let elapsed_ms = self.elapsed().as_secs_f64() * 1e3;
        info!(stage = %self.label, elapsed_ms, "finished");
    }
}
