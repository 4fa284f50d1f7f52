use core::fmt;
use std::sync::Arc;

/// Network identity of a cluster member.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberAddress(Arc<str>);

impl MemberAddress {
    pub fn new(address: impl AsRef<str>) -> Self {
        Self(Arc::from(address.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for MemberAddress {
    fn from(address: String) -> Self {
        Self(Arc::from(address))
    }
}

/// Index of a partition of the sequence-name space.
pub type PartitionId = u32;

/// Deterministic hash used to select a partition for a sequence name.
pub fn hash_partition_key(key: impl AsRef<[u8]>) -> u64 {
    // 64-bit FNV-1a keeps the hash stable across toolchains and processes.
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;
    key.as_ref().iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

/// Maps `sequence` onto one of `partition_count` partitions.
#[allow(clippy::cast_possible_truncation)]
pub fn partition_for(sequence: &str, partition_count: u32) -> PartitionId {
    (hash_partition_key(sequence) % u64::from(partition_count.max(1))) as PartitionId
}
