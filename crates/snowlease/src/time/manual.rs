use std::sync::Arc;

use portable_atomic::{AtomicU64, Ordering};

use crate::TimeSource;

/// A clock that only moves when told to.
///
/// Clones share the same reading, so a test can hand one copy to a
/// [`Sequencer`] and advance time from another thread.
///
/// [`Sequencer`]: crate::Sequencer
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(unix_millis: u64) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(unix_millis)),
        }
    }

    pub fn set(&self, unix_millis: u64) {
        self.millis.store(unix_millis, Ordering::Release);
    }

    /// Moves the clock forward and returns the new reading.
    pub fn advance(&self, millis: u64) -> u64 {
        self.millis.fetch_add(millis, Ordering::AcqRel) + millis
    }
}

impl TimeSource for ManualClock {
    fn current_millis(&self) -> u64 {
        self.millis.load(Ordering::Acquire)
    }
}
