use core::fmt;

use crate::{Error, LogicalNodeId, Result};

/// Bits available to the three ID fields. Bit 63 is never set so IDs stay
/// non-negative when stored as signed 64-bit integers.
pub const USABLE_BITS: u32 = 63;

/// Smallest accepted timestamp field: 2^36 ms is a little over two years.
pub const MIN_TIMESTAMP_BITS: u32 = 36;

/// Largest accepted counter field.
pub const MAX_COUNTER_BITS: u32 = 22;

/// Default counter width: 4095 IDs per millisecond per logical node.
pub const DEFAULT_COUNTER_BITS: u32 = 12;

/// Upper bound on `max_logical_node_count` (every id fits a [`LogicalNodeId`]).
pub const MAX_LOGICAL_NODE_COUNT: u32 = 1 << 16;

/// A 64-bit identifier produced by a [`Sequencer`].
///
/// The value is opaque on its own; decode it with the [`BitLayout`] of the
/// sequence that produced it.
///
/// [`Sequencer`]: crate::Sequencer
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceId(u64);

impl SequenceId {
    /// Wraps a raw value, e.g. one read back from storage.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw 64-bit value.
    pub const fn to_raw(self) -> u64 {
        self.0
    }

    /// Returns the value as a signed integer. Always non-negative.
    #[allow(clippy::cast_possible_wrap)]
    pub const fn to_i64(self) -> i64 {
        self.0 as i64
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SequenceId> for u64 {
    fn from(id: SequenceId) -> Self {
        id.0
    }
}

/// Split of the 63 usable ID bits into timestamp, logical node id and
/// counter, most significant first.
///
/// ```text
///  Bit Index:  63           62            N+C  N+C-1         C  C-1          0
///              +--------------+----------------+-------------+---------------+
///  Field:      | reserved (1) | timestamp (T)  | node id (N) | counter (C)   |
///              +--------------+----------------+-------------+---------------+
/// ```
///
/// `N = ceil(log2(max_logical_node_count))`, `C` is configured per sequence and
/// `T = 63 - N - C`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BitLayout {
    node_bits: u32,
    counter_bits: u32,
}

impl BitLayout {
    /// Computes the layout for a sequence.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when `max_logical_node_count` is zero
    /// or above [`MAX_LOGICAL_NODE_COUNT`], when `counter_bits` is outside
    /// `1..=MAX_COUNTER_BITS`, or when the remaining timestamp field would be
    /// narrower than [`MIN_TIMESTAMP_BITS`].
    pub fn new(max_logical_node_count: u32, counter_bits: u32) -> Result<Self> {
        if max_logical_node_count == 0 || max_logical_node_count > MAX_LOGICAL_NODE_COUNT {
            return Err(Error::configuration(format!(
                "max_logical_node_count must be within 1..={MAX_LOGICAL_NODE_COUNT}, got {max_logical_node_count}"
            )));
        }
        if counter_bits == 0 || counter_bits > MAX_COUNTER_BITS {
            return Err(Error::configuration(format!(
                "counter_bits must be within 1..={MAX_COUNTER_BITS}, got {counter_bits}"
            )));
        }

        let node_bits = node_bits_for(max_logical_node_count);
        if node_bits + counter_bits >= USABLE_BITS {
            return Err(Error::configuration(format!(
                "node bits ({node_bits}) + counter bits ({counter_bits}) leave no timestamp bits"
            )));
        }
        let timestamp_bits = USABLE_BITS - node_bits - counter_bits;
        if timestamp_bits < MIN_TIMESTAMP_BITS {
            return Err(Error::configuration(format!(
                "timestamp field of {timestamp_bits} bits is below the minimum of {MIN_TIMESTAMP_BITS}"
            )));
        }

        Ok(Self {
            node_bits,
            counter_bits,
        })
    }

    pub const fn node_bits(&self) -> u32 {
        self.node_bits
    }

    pub const fn counter_bits(&self) -> u32 {
        self.counter_bits
    }

    pub const fn timestamp_bits(&self) -> u32 {
        USABLE_BITS - self.node_bits - self.counter_bits
    }

    /// Largest encodable timestamp, in milliseconds since the epoch.
    pub const fn max_timestamp(&self) -> u64 {
        (1 << self.timestamp_bits()) - 1
    }

    /// Largest node id the node field can hold.
    pub const fn max_node_id(&self) -> u32 {
        (1 << self.node_bits) - 1
    }

    /// Largest counter value handed out within one millisecond.
    pub const fn max_millis_counter(&self) -> u32 {
        (1 << self.counter_bits) - 1
    }

    const fn node_shift(&self) -> u32 {
        self.counter_bits
    }

    const fn timestamp_shift(&self) -> u32 {
        self.counter_bits + self.node_bits
    }

    /// Packs the three fields into an ID. Out-of-range inputs are masked to
    /// their field width.
    pub const fn encode(&self, timestamp: u64, node_id: LogicalNodeId, counter: u32) -> SequenceId {
        let timestamp = (timestamp & self.max_timestamp()) << self.timestamp_shift();
        let node_id = ((node_id as u64) & self.max_node_id() as u64) << self.node_shift();
        let counter = (counter as u64) & self.max_millis_counter() as u64;
        SequenceId(timestamp | node_id | counter)
    }

    /// Extracts the timestamp field.
    pub const fn timestamp_of(&self, id: SequenceId) -> u64 {
        (id.0 >> self.timestamp_shift()) & self.max_timestamp()
    }

    /// Extracts the logical node id field.
    #[allow(clippy::cast_possible_truncation)]
    pub const fn node_id_of(&self, id: SequenceId) -> LogicalNodeId {
        ((id.0 >> self.node_shift()) & self.max_node_id() as u64) as LogicalNodeId
    }

    /// Extracts the counter field.
    #[allow(clippy::cast_possible_truncation)]
    pub const fn counter_of(&self, id: SequenceId) -> u32 {
        (id.0 & self.max_millis_counter() as u64) as u32
    }
}

/// `ceil(log2(count))`: the minimum width holding ids `0..count`.
const fn node_bits_for(count: u32) -> u32 {
    if count <= 1 {
        0
    } else {
        u32::BITS - (count - 1).leading_zeros()
    }
}
