//! Idle backoff for worker polling loops.

use std::thread;
use std::time::Duration;

/// Doubling sleep between empty polls, reset on the first received message.
pub(crate) struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub(crate) fn new(max: Duration) -> Self {
        Self {
            current: Duration::from_millis(1),
            max,
        }
    }

    pub(crate) fn wait(&mut self) {
        thread::sleep(self.current);
        self.current = (self.current * 2).min(self.max);
    }

    pub(crate) fn reset(&mut self) {
        self.current = Duration::from_millis(1);
    }
}
