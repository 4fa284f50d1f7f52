use portable_atomic::{AtomicU64, Ordering};

/// The packed `timestamp | counter` register of a sequencer.
///
/// ```text
///  +-------------------------------+------------------+
///  | last timestamp (64 - C bits)  | counter (C bits) |
///  +-------------------------------+------------------+
/// ```
///
/// Only ever mutated by compare-and-swap. The counter restarts at zero when
/// the timestamp moves forward and the first value handed out per
/// millisecond is 1.
#[derive(Debug)]
pub(crate) struct TimestampCounter {
    #[cfg(feature = "cache-padded")]
    state: crossbeam_utils::CachePadded<AtomicU64>,
    #[cfg(not(feature = "cache-padded"))]
    state: AtomicU64,
    counter_bits: u32,
}

impl TimestampCounter {
    pub(crate) fn new(counter_bits: u32) -> Self {
        Self {
            #[cfg(feature = "cache-padded")]
            state: crossbeam_utils::CachePadded::new(AtomicU64::new(0)),
            #[cfg(not(feature = "cache-padded"))]
            state: AtomicU64::new(0),
            counter_bits,
        }
    }

    const fn pack(&self, timestamp: u64, counter: u64) -> u64 {
        (timestamp << self.counter_bits) | counter
    }

    const fn timestamp(&self, raw: u64) -> u64 {
        raw >> self.counter_bits
    }

    const fn counter(&self, raw: u64) -> u64 {
        raw & ((1 << self.counter_bits) - 1)
    }

    /// Rolls the register forward to `timestamp` with a zeroed counter if it
    /// is strictly newer than the stored one. Losing the race to another
    /// thread that already moved it far enough is fine.
    pub(crate) fn advance(&self, timestamp: u64) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if self.timestamp(current) >= timestamp {
                return;
            }
            match self.state.compare_exchange_weak(
                current,
                self.pack(timestamp, 0),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Takes the next counter value for `expected_timestamp`.
    ///
    /// Returns `None` if the register has moved to a different timestamp or
    /// the counter would exceed `max_counter`.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn increment(&self, expected_timestamp: u64, max_counter: u32) -> Option<u32> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if self.timestamp(current) != expected_timestamp {
                return None;
            }
            let next = self.counter(current) + 1;
            if next > u64::from(max_counter) {
                return None;
            }
            match self.state.compare_exchange_weak(
                current,
                self.pack(expected_timestamp, next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(next as u32),
                Err(actual) => current = actual,
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn load(&self) -> (u64, u64) {
        let raw = self.state.load(Ordering::Acquire);
        (self.timestamp(raw), self.counter(raw))
    }
}
