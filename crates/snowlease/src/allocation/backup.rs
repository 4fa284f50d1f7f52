use std::collections::HashMap;

use tracing::{debug, trace};

use crate::{
    AllocationTable, BackupOperation, LogicalNodeId, MemberAddress, Mutation, PartitionId,
    PartitionSnapshot,
};

/// A member's backup copies of the partitions it is a backup of.
///
/// Every `apply_*` method is idempotent: replaying an operation, or applying
/// the release of an id that is not recorded, leaves the copy unchanged.
/// Each returns `true` if the copy changed.
#[derive(Debug, Default)]
pub struct BackupReplica {
    partitions: HashMap<PartitionId, PartitionSnapshot>,
}

impl BackupReplica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies any operation sent by a partition owner.
    pub fn apply(&mut self, partition: PartitionId, operation: &BackupOperation) -> bool {
        trace!(partition, ?operation, "Applying backup operation");
        match operation {
            BackupOperation::Apply(mutation) => self.apply_mutation(partition, mutation),
            BackupOperation::DropSequence { sequence } => self.drop_sequence(partition, sequence),
            BackupOperation::ReleaseMember { address } => self.release_member(partition, address),
            BackupOperation::Sync(snapshot) => {
                debug!(partition, sequences = snapshot.tables.len(), "Installing partition sync");
                let tables = snapshot.tables.clone();
                let previous = self.partitions.insert(
                    partition,
                    PartitionSnapshot { partition, tables },
                );
                previous.is_none_or(|old| old.tables != snapshot.tables)
            }
        }
    }

    pub fn apply_mutation(&mut self, partition: PartitionId, mutation: &Mutation) -> bool {
        self.partitions
            .entry(partition)
            .or_insert_with(|| PartitionSnapshot::new(partition))
            .tables
            .entry(mutation.sequence.clone())
            .or_default()
            .apply(mutation)
    }

    pub fn apply_allocate(
        &mut self,
        partition: PartitionId,
        sequence: &str,
        node_id: LogicalNodeId,
        address: MemberAddress,
    ) -> bool {
        self.apply_mutation(partition, &Mutation::allocate(sequence, node_id, address))
    }

    pub fn apply_release(
        &mut self,
        partition: PartitionId,
        sequence: &str,
        node_id: LogicalNodeId,
        address: MemberAddress,
    ) -> bool {
        self.apply_mutation(partition, &Mutation::release(sequence, node_id, address))
    }

    fn drop_sequence(&mut self, partition: PartitionId, sequence: &str) -> bool {
        self.partitions
            .get_mut(&partition)
            .and_then(|p| p.tables.remove(sequence))
            .is_some()
    }

    fn release_member(&mut self, partition: PartitionId, address: &MemberAddress) -> bool {
        let Some(snapshot) = self.partitions.get_mut(&partition) else {
            return false;
        };
        let mut changed = false;
        for table in snapshot.tables.values_mut() {
            changed |= !table.remove_member(address).is_empty();
        }
        changed
    }

    pub fn table(&self, partition: PartitionId, sequence: &str) -> Option<&AllocationTable> {
        self.partitions.get(&partition)?.tables.get(sequence)
    }

    /// Copy of the backup state of `partition`; empty if none is held.
    pub fn snapshot(&self, partition: PartitionId) -> PartitionSnapshot {
        self.partitions
            .get(&partition)
            .cloned()
            .unwrap_or_else(|| PartitionSnapshot::new(partition))
    }

    /// Hands the backup state of `partition` over for promotion to owner.
    pub fn promote(&mut self, partition: PartitionId) -> PartitionSnapshot {
        self.partitions
            .remove(&partition)
            .unwrap_or_else(|| PartitionSnapshot::new(partition))
    }

    /// Drops the copy of a partition this member no longer backs up.
    pub fn drop_partition(&mut self, partition: PartitionId) -> bool {
        self.partitions.remove(&partition).is_some()
    }

    /// Partitions this replica holds a copy of, ascending.
    pub fn partitions(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<_> = self.partitions.keys().copied().collect();
        partitions.sort_unstable();
        partitions
    }
}
