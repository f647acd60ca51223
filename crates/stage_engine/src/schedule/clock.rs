use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Source of session time. Injected so tests can drive virtual time.
pub trait FrameClock {
    fn now(&self) -> Duration;
}

/// Wall-clock time measured from construction.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    started: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl FrameClock for SystemClock {
    fn now(&self) -> Duration {
        Instant::now().saturating_duration_since(self.started)
    }
}

/// Virtual time advanced by hand. Clones share the same time source, so a
/// test can keep one handle while the session owns another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<Duration>>,
}

impl ManualClock {
    pub fn advance(&self, delta: Duration) {
        self.now.set(self.now.get().saturating_add(delta));
    }

    pub fn set(&self, now: Duration) {
        self.now.set(now);
    }
}

impl FrameClock for ManualClock {
    fn now(&self) -> Duration {
        self.now.get()
    }
}
