use std::collections::BTreeMap;

use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use crate::{
    AllocationTable, BackupChannel, BackupOperation, Error, LogicalNodeId, MemberAddress,
    Mutation, PartitionId, PartitionSnapshot, Result, SequenceDefinition,
};

/// Owner-side allocation state of one partition.
///
/// Holds the authoritative [`AllocationTable`] of every sequence hashed to the
/// partition. Each mutation is applied locally, then replicated to the
/// backups through the [`BackupChannel`]; the call resolves only after every
/// required backup acknowledged. If any backup fails, the local change is
/// rolled back, the backups that did acknowledge receive the inverse
/// operation and [`Error::Replication`] is returned, so a mutation is either
/// visible everywhere or nowhere.
///
/// Methods take `&mut self`: callers serialize access per partition (see
/// [`PartitionHandle`]).
///
/// [`PartitionHandle`]: crate::PartitionHandle
#[derive(Debug)]
pub struct NodeIdAllocator<C: BackupChannel> {
    partition: PartitionId,
    tables: BTreeMap<String, AllocationTable>,
    backups: Vec<MemberAddress>,
    channel: C,
}

impl<C: BackupChannel> NodeIdAllocator<C> {
    pub fn new(partition: PartitionId, channel: C) -> Self {
        Self {
            partition,
            tables: BTreeMap::new(),
            backups: Vec::new(),
            channel,
        }
    }

    /// Sets the initial backups without syncing them; use on a fresh
    /// allocator whose backups hold no state yet.
    #[must_use]
    pub fn with_backups(mut self, backups: Vec<MemberAddress>) -> Self {
        self.backups = backups;
        self
    }

    pub const fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Current backups, in promotion order.
    pub fn backups(&self) -> &[MemberAddress] {
        &self.backups
    }

    pub fn table(&self, sequence: &str) -> Option<&AllocationTable> {
        self.tables.get(sequence)
    }

    /// Leases the lowest free id of `definition` to `requester`.
    ///
    /// The mutation is replicated to the first
    /// `min(backup_count, backups.len())` backups.
    ///
    /// # Errors
    ///
    /// - [`Error::CapacityExhausted`] if every id is leased.
    /// - [`Error::Replication`] if a backup failed; nothing was allocated.
    #[instrument(
        level = "debug",
        skip_all,
        fields(partition = self.partition, sequence = definition.name(), requester = %requester)
    )]
    pub async fn allocate(
        &mut self,
        definition: &SequenceDefinition,
        requester: &MemberAddress,
    ) -> Result<LogicalNodeId> {
        let sequence = definition.name();
        let max = definition.max_logical_node_count();
        let table = self.tables.entry(sequence.to_owned()).or_default();
        let Some(node_id) = table.lowest_free(max) else {
            debug!(max, "No free logical node id");
            return Err(Error::CapacityExhausted {
                sequence: sequence.to_owned(),
                max,
            });
        };
        table.insert(node_id, requester.clone());

        let mutation = Mutation::allocate(sequence, node_id, requester.clone());
        let undo = [BackupOperation::Apply(mutation.inverse())];
        if let Err(e) = self
            .replicate(
                definition.backup_count(),
                &BackupOperation::Apply(mutation),
                &undo,
            )
            .await
        {
            if let Some(table) = self.tables.get_mut(sequence) {
                table.remove_held(node_id, requester);
            }
            return Err(e);
        }

        debug!(node_id, "Allocated logical node id");
        Ok(node_id)
    }

    /// Frees `node_id` if `requester` holds it. Releasing an id that is free
    /// or held by another member succeeds without effect.
    ///
    /// # Errors
    ///
    /// [`Error::Replication`] if a backup failed; the id stays leased.
    #[instrument(
        level = "debug",
        skip_all,
        fields(partition = self.partition, sequence = definition.name(), requester = %requester, node_id = node_id)
    )]
    pub async fn release(
        &mut self,
        definition: &SequenceDefinition,
        requester: &MemberAddress,
        node_id: LogicalNodeId,
    ) -> Result<()> {
        let sequence = definition.name();
        let released = self
            .tables
            .get_mut(sequence)
            .is_some_and(|table| table.remove_held(node_id, requester));
        if !released {
            debug!("Logical node id not held by requester, ignoring release");
            return Ok(());
        }

        let mutation = Mutation::release(sequence, node_id, requester.clone());
        let undo = [BackupOperation::Apply(mutation.inverse())];
        if let Err(e) = self
            .replicate(
                definition.backup_count(),
                &BackupOperation::Apply(mutation),
                &undo,
            )
            .await
        {
            self.tables
                .entry(sequence.to_owned())
                .or_default()
                .insert(node_id, requester.clone());
            return Err(e);
        }

        debug!("Released logical node id");
        Ok(())
    }

    /// Frees every id `address` holds in this partition, e.g. after the
    /// member left the cluster. Returns the number of ids freed.
    ///
    /// # Errors
    ///
    /// [`Error::Replication`] if a backup failed; the ids stay leased.
    #[instrument(level = "debug", skip_all, fields(partition = self.partition, member = %address))]
    pub async fn release_member(&mut self, address: &MemberAddress) -> Result<usize> {
        let mut removed: Vec<(String, LogicalNodeId)> = Vec::new();
        for (sequence, table) in &mut self.tables {
            removed.extend(
                table
                    .remove_member(address)
                    .into_iter()
                    .map(|id| (sequence.clone(), id)),
            );
        }
        if removed.is_empty() {
            return Ok(0);
        }

        let undo: Vec<_> = removed
            .iter()
            .map(|(sequence, id)| {
                BackupOperation::Apply(Mutation::allocate(sequence.as_str(), *id, address.clone()))
            })
            .collect();
        let operation = BackupOperation::ReleaseMember {
            address: address.clone(),
        };
        if let Err(e) = self.replicate(self.backups.len(), &operation, &undo).await {
            for (sequence, id) in removed {
                self.tables
                    .entry(sequence)
                    .or_default()
                    .insert(id, address.clone());
            }
            return Err(e);
        }

        info!(released = removed.len(), "Released logical node ids of member");
        Ok(removed.len())
    }

    /// Discards the allocation table of a destroyed sequence here and on
    /// every backup.
    ///
    /// # Errors
    ///
    /// [`Error::Replication`] if a backup failed; the table is kept.
    #[instrument(level = "debug", skip_all, fields(partition = self.partition, sequence = %sequence))]
    pub async fn drop_sequence(&mut self, sequence: &str) -> Result<()> {
        let Some(table) = self.tables.remove(sequence) else {
            return Ok(());
        };

        let undo: Vec<_> = table
            .iter()
            .map(|(id, address)| {
                BackupOperation::Apply(Mutation::allocate(sequence, id, address.clone()))
            })
            .collect();
        let operation = BackupOperation::DropSequence {
            sequence: sequence.to_owned(),
        };
        if let Err(e) = self.replicate(self.backups.len(), &operation, &undo).await {
            self.tables.insert(sequence.to_owned(), table);
            return Err(e);
        }

        debug!(released = table.len(), "Dropped allocation table");
        Ok(())
    }

    /// Replaces the local state with a promoted backup copy.
    #[instrument(level = "info", skip_all, fields(partition = self.partition))]
    pub fn take_over_from_backup(&mut self, snapshot: PartitionSnapshot) {
        if snapshot.partition != self.partition {
            warn!(
                from = snapshot.partition,
                "Taking over a snapshot of a different partition"
            );
        }
        info!(sequences = snapshot.tables.len(), "Took over allocation state from backup");
        self.tables = snapshot.tables;
    }

    /// Copy of every table in this partition.
    pub fn snapshot(&self) -> PartitionSnapshot {
        PartitionSnapshot {
            partition: self.partition,
            tables: self.tables.clone(),
        }
    }

    /// Installs a new backup list. Every backup whose position in the list
    /// changed is first brought up to date with a full
    /// [`BackupOperation::Sync`], since sequences replicate to a prefix of the
    /// list only. Backups that cannot be reached are left out.
    #[instrument(level = "debug", skip_all, fields(partition = self.partition))]
    pub async fn set_backups(&mut self, backups: Vec<MemberAddress>) {
        let fresh: Vec<_> = backups
            .iter()
            .enumerate()
            .filter(|(i, b)| self.backups.get(*i) != Some(*b))
            .map(|(_, b)| b.clone())
            .collect();

        let mut unreachable = Vec::new();
        if !fresh.is_empty() {
            let sync = BackupOperation::Sync(self.snapshot());
            let results = join_all(
                fresh
                    .iter()
                    .map(|backup| self.channel.send(backup, self.partition, &sync)),
            )
            .await;
            for (backup, result) in fresh.into_iter().zip(results) {
                if let Err(e) = result {
                    warn!(%backup, error = %e, "Failed to sync new backup");
                    unreachable.push(backup);
                }
            }
        }

        self.backups = backups
            .into_iter()
            .filter(|b| !unreachable.contains(b))
            .collect();
        debug!(backups = ?self.backups, "Backups updated");
    }

    async fn replicate(
        &self,
        backup_count: usize,
        operation: &BackupOperation,
        undo: &[BackupOperation],
    ) -> Result<()> {
        let targets = &self.backups[..backup_count.min(self.backups.len())];
        if targets.len() < backup_count {
            warn!(
                required = backup_count,
                available = targets.len(),
                "Fewer backups available than configured"
            );
        }
        if targets.is_empty() {
            return Ok(());
        }

        let results = join_all(
            targets
                .iter()
                .map(|backup| self.channel.send(backup, self.partition, operation)),
        )
        .await;

        let mut acked = Vec::with_capacity(targets.len());
        let mut failure = None;
        for (backup, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => acked.push(backup),
                Err(e) => {
                    if failure.is_none() {
                        failure = Some((backup, e));
                    }
                }
            }
        }
        let Some((backup, e)) = failure else {
            return Ok(());
        };

        warn!(%backup, error = %e, "Backup did not acknowledge, rolling back");
        self.compensate(&acked, undo).await;
        Err(Error::Replication {
            sequence: operation.sequence().unwrap_or_default().to_owned(),
            backup: backup.clone(),
            reason: e.to_string(),
        })
    }

    async fn compensate(&self, acked: &[&MemberAddress], undo: &[BackupOperation]) {
        for backup in acked {
            for operation in undo {
                if let Err(e) = self.channel.send(backup, self.partition, operation).await {
                    warn!(%backup, error = %e, "Failed to compensate backup");
                }
            }
        }
    }
}
