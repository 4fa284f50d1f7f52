use core::time::Duration;
use std::{
    sync::{Arc, OnceLock},
    thread::{self, JoinHandle},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use portable_atomic::{AtomicU64, Ordering};

use crate::TimeSource;

/// Shared ticker thread that updates every millisecond.
#[derive(Debug)]
struct SharedTickerInner {
    current: AtomicU64,
    _handle: OnceLock<JoinHandle<()>>,
}

/// A wall-clock source that never goes backward.
///
/// The wall-clock time is sampled once at construction. After that, readings
/// advance with a monotonic timer (`Instant`), so NTP steps or manual clock
/// changes on the host cannot make a [`Sequencer`] see time run backward.
///
/// A background thread refreshes a shared atomic once per millisecond, which
/// keeps syscalls off the ID hot path. Clones share the same ticker; the
/// thread exits once the last clone is dropped.
///
/// [`Sequencer`]: crate::Sequencer
#[derive(Clone, Debug)]
pub struct MonotonicClock {
    inner: Arc<SharedTickerInner>,
    start_unix_millis: u64,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    /// Starts a clock anchored at the current wall-clock time.
    #[allow(clippy::cast_possible_truncation)]
    pub fn new() -> Self {
        let start = Instant::now();
        // A host clock before 1970 is treated as 1970; the epoch clamps anyway.
        let start_unix_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let inner = Arc::new(SharedTickerInner {
            current: AtomicU64::new(0),
            _handle: OnceLock::new(),
        });

        let weak_inner = Arc::downgrade(&inner);
        let handle = thread::spawn(move || {
            let mut tick = 0;

            loop {
                let Some(inner_ref) = weak_inner.upgrade() else {
                    break;
                };

                // Compute the absolute target time of the next tick
                let target = start + Duration::from_millis(tick);

                let now = Instant::now();
                if now < target {
                    thread::sleep(target - now);
                }

                let now_ms = start.elapsed().as_millis() as u64;
                inner_ref.current.store(now_ms, Ordering::Release);

                // Align to next tick after the current actual time
                tick = now_ms + 1;
            }
        });

        let _ = inner._handle.set(handle);

        Self {
            inner,
            start_unix_millis,
        }
    }
}

impl TimeSource for MonotonicClock {
    fn current_millis(&self) -> u64 {
        self.start_unix_millis + self.inner.current.load(Ordering::Acquire)
    }
}
