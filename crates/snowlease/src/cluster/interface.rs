use core::future::Future;
use std::sync::Arc;

use crate::{
    BackupOperation, LogicalNodeId, MemberAddress, PartitionId, Result, SequenceDefinition,
};

/// The member-side view of the request router: leases and releases logical
/// node ids on whichever member owns the sequence's partition.
///
/// Implementations are bound to the calling member's address.
pub trait LeaseService: Send + Sync {
    /// Leases the lowest free logical node id of `definition`.
    ///
    /// # Errors
    ///
    /// [`Error::CapacityExhausted`], [`Error::Replication`],
    /// [`Error::UnknownSequence`] or [`Error::Unavailable`].
    ///
    /// [`Error::CapacityExhausted`]: crate::Error::CapacityExhausted
    /// [`Error::Replication`]: crate::Error::Replication
    /// [`Error::UnknownSequence`]: crate::Error::UnknownSequence
    /// [`Error::Unavailable`]: crate::Error::Unavailable
    fn acquire(
        &self,
        definition: &SequenceDefinition,
    ) -> impl Future<Output = Result<LogicalNodeId>> + Send;

    /// Returns `node_id` to the allocator. Releasing an id that is not held by
    /// this member succeeds without effect.
    ///
    /// # Errors
    ///
    /// [`Error::Replication`] or [`Error::Unavailable`].
    ///
    /// [`Error::Replication`]: crate::Error::Replication
    /// [`Error::Unavailable`]: crate::Error::Unavailable
    fn release(
        &self,
        definition: &SequenceDefinition,
        node_id: LogicalNodeId,
    ) -> impl Future<Output = Result<()>> + Send;
}

impl<L: LeaseService> LeaseService for Arc<L> {
    fn acquire(
        &self,
        definition: &SequenceDefinition,
    ) -> impl Future<Output = Result<LogicalNodeId>> + Send {
        (**self).acquire(definition)
    }

    fn release(
        &self,
        definition: &SequenceDefinition,
        node_id: LogicalNodeId,
    ) -> impl Future<Output = Result<()>> + Send {
        (**self).release(definition, node_id)
    }
}

/// Synchronous replication link from a partition owner to its backups.
///
/// `send` resolves once the backup has applied the operation.
pub trait BackupChannel: Send + Sync + 'static {
    /// # Errors
    ///
    /// Any error means the backup did not acknowledge the operation.
    fn send(
        &self,
        backup: &MemberAddress,
        partition: PartitionId,
        operation: &BackupOperation,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Partition ownership as published by the cluster substrate.
pub trait PartitionRouter {
    /// The partition a sequence name belongs to.
    fn partition_of(&self, sequence: &str) -> PartitionId;

    /// The member currently owning `partition`, if any.
    fn owner_of(&self, partition: PartitionId) -> Option<MemberAddress>;

    /// The members backing up `partition`, in promotion order.
    fn backups_of(&self, partition: PartitionId) -> Vec<MemberAddress>;
}
