use core::time::Duration;

use crate::{CUSTOM_EPOCH, TimeSource};

/// The zero point of a sequence's timestamp field.
///
/// `epoch_millis(now) = now - offset`, clamped at zero for clocks that read
/// earlier than the epoch. Skew correction is left to the deployment; the
/// result is only as monotonic as the clock feeding it.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Epoch {
    offset_millis: u64,
}

impl Default for Epoch {
    fn default() -> Self {
        Self::from_duration(CUSTOM_EPOCH)
    }
}

impl Epoch {
    /// An epoch `offset_millis` after 1970-01-01 UTC.
    pub const fn from_unix_millis(offset_millis: u64) -> Self {
        Self { offset_millis }
    }

    /// An epoch expressed as a [`Duration`] since 1970-01-01 UTC, like the
    /// constants in this module.
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_duration(since_unix: Duration) -> Self {
        Self::from_unix_millis(since_unix.as_millis() as u64)
    }

    pub const fn offset_millis(&self) -> u64 {
        self.offset_millis
    }

    /// Converts a wall-clock reading into milliseconds since this epoch.
    pub const fn epoch_millis(&self, unix_millis: u64) -> u64 {
        unix_millis.saturating_sub(self.offset_millis)
    }

    /// Reads `clock` and returns milliseconds since this epoch.
    pub fn now<T: TimeSource + ?Sized>(&self, clock: &T) -> u64 {
        self.epoch_millis(clock.current_millis())
    }

    /// Maps an embedded timestamp back to wall-clock milliseconds.
    pub const fn to_unix_millis(&self, epoch_millis: u64) -> u64 {
        epoch_millis.saturating_add(self.offset_millis)
    }
}
