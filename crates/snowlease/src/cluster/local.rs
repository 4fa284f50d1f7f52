use core::{
    future::{Future, ready},
    time::Duration,
};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Weak},
};

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, instrument, warn};

use crate::{
    AllocationTable, BackupChannel, BackupOperation, BackupReplica, Error, INCREMENT_RETRY_INTERVAL,
    LeaseService, LogicalNodeId, MAX_BACKUP_COUNT, MemberAddress, MonotonicClock,
    NodeIdAllocator, PartitionHandle, PartitionId, PartitionRouter, PartitionSnapshot, Result,
    SequenceDefinition, SequenceEvent, SequenceRegistry, Sequencer, TimeSource, partition_for,
};

/// Default number of partitions of the sequence-name space.
pub const DEFAULT_PARTITION_COUNT: u32 = 16;

/// First port of the synthetic member addresses.
const BASE_PORT: u16 = 5701;

/// A [`Sequencer`] wired to a [`LocalCluster`] member.
pub type LocalSequencer<T = MonotonicClock> = Sequencer<MemberLeaseClient, T>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalClusterConfig {
    /// Number of members to start.
    pub members: usize,
    pub partition_count: u32,
    /// Back-off handed to sequencers for an exhausted millisecond.
    pub retry_interval: Duration,
    /// Queue depth of each partition actor.
    pub request_buffer: usize,
}

impl Default for LocalClusterConfig {
    fn default() -> Self {
        Self {
            members: 3,
            partition_count: DEFAULT_PARTITION_COUNT,
            retry_interval: INCREMENT_RETRY_INTERVAL,
            request_buffer: 64,
        }
    }
}

impl LocalClusterConfig {
    fn validate(&self) -> Result<()> {
        if self.members == 0 || self.members > usize::from(u16::MAX - BASE_PORT) {
            return Err(Error::configuration(format!(
                "members must be within 1..={}, got {}",
                u16::MAX - BASE_PORT,
                self.members
            )));
        }
        if self.partition_count == 0 {
            return Err(Error::configuration("partition_count must be positive"));
        }
        if self.request_buffer == 0 {
            return Err(Error::configuration("request_buffer must be positive"));
        }
        Ok(())
    }
}

/// Stand-in for the network between members: each member's backup copies
/// and the set of members that are unreachable.
#[derive(Debug)]
struct Network {
    replicas: HashMap<MemberAddress, Mutex<BackupReplica>>,
    unreachable: RwLock<HashSet<MemberAddress>>,
}

impl Network {
    fn is_reachable(&self, member: &MemberAddress) -> bool {
        !self.unreachable.read().contains(member)
    }

    /// Applies `operation` to `backup`'s copy of `partition`.
    ///
    /// Reachability of both ends is checked under the replica lock, so a
    /// write from a member that failed meanwhile either lands before its
    /// partitions are promoted or not at all.
    fn deliver(
        &self,
        sender: &MemberAddress,
        backup: &MemberAddress,
        partition: PartitionId,
        operation: &BackupOperation,
    ) -> Result<()> {
        let replica = self
            .replicas
            .get(backup)
            .ok_or_else(|| Error::unavailable(format!("member {backup} is not in the cluster")))?;
        let mut replica = replica.lock();
        for member in [sender, backup] {
            if !self.is_reachable(member) {
                return Err(Error::unavailable(format!("member {member} is unreachable")));
            }
        }
        replica.apply(partition, operation);
        Ok(())
    }
}

/// [`BackupChannel`] delivering straight into the in-process replicas on
/// behalf of one partition owner.
#[derive(Clone, Debug)]
pub struct LocalBackupChannel {
    network: Arc<Network>,
    sender: MemberAddress,
}

impl BackupChannel for LocalBackupChannel {
    fn send(
        &self,
        backup: &MemberAddress,
        partition: PartitionId,
        operation: &BackupOperation,
    ) -> impl Future<Output = Result<()>> + Send {
        ready(
            self.network
                .deliver(&self.sender, backup, partition, operation),
        )
    }
}

#[derive(Debug)]
struct Placement {
    owner: MemberAddress,
    backups: Vec<MemberAddress>,
    handle: PartitionHandle,
}

#[derive(Debug)]
struct ClusterInner {
    config: LocalClusterConfig,
    members: Vec<MemberAddress>,
    network: Arc<Network>,
    placements: RwLock<Vec<Placement>>,
    registry: SequenceRegistry,
    clock: MonotonicClock,
    failover: tokio::sync::Mutex<()>,
}

impl ClusterInner {
    fn check_member(&self, member: &MemberAddress) -> Result<()> {
        if !self.members.contains(member) {
            return Err(Error::configuration(format!(
                "{member} is not a member of this cluster"
            )));
        }
        if !self.network.is_reachable(member) {
            return Err(Error::unavailable(format!("member {member} is down")));
        }
        Ok(())
    }

    fn owner_handle(&self, sequence: &str) -> Result<PartitionHandle> {
        let partition = self.partition_of(sequence);
        let placements = self.placements.read();
        let placement = placements
            .get(partition as usize)
            .ok_or_else(|| Error::unavailable(format!("partition {partition} is not placed")))?;
        if !self.network.is_reachable(&placement.owner) {
            return Err(Error::unavailable(format!(
                "owner {} of partition {partition} is down",
                placement.owner
            )));
        }
        Ok(placement.handle.clone())
    }

    fn live_members(&self) -> Vec<MemberAddress> {
        self.members
            .iter()
            .filter(|m| self.network.is_reachable(m))
            .cloned()
            .collect()
    }
}

impl PartitionRouter for ClusterInner {
    fn partition_of(&self, sequence: &str) -> PartitionId {
        partition_for(sequence, self.config.partition_count)
    }

    fn owner_of(&self, partition: PartitionId) -> Option<MemberAddress> {
        self.placements
            .read()
            .get(partition as usize)
            .map(|p| p.owner.clone())
    }

    fn backups_of(&self, partition: PartitionId) -> Vec<MemberAddress> {
        self.placements
            .read()
            .get(partition as usize)
            .map(|p| p.backups.clone())
            .unwrap_or_default()
    }
}

/// The [`LeaseService`] of one member: routes lease requests to the owner
/// of the sequence's partition.
#[derive(Clone, Debug)]
pub struct MemberLeaseClient {
    member: MemberAddress,
    cluster: Arc<ClusterInner>,
}

impl MemberLeaseClient {
    pub const fn member(&self) -> &MemberAddress {
        &self.member
    }
}

impl LeaseService for MemberLeaseClient {
    fn acquire(
        &self,
        definition: &SequenceDefinition,
    ) -> impl Future<Output = Result<LogicalNodeId>> + Send {
        async move {
            self.cluster.check_member(&self.member)?;
            // The registered definition is authoritative.
            let definition = self.cluster.registry.sequence(definition.name())?;
            let handle = self.cluster.owner_handle(definition.name())?;
            handle.acquire(&definition, &self.member).await
        }
    }

    fn release(
        &self,
        definition: &SequenceDefinition,
        node_id: LogicalNodeId,
    ) -> impl Future<Output = Result<()>> + Send {
        async move {
            let Ok(registered) = self.cluster.registry.sequence(definition.name()) else {
                debug!(sequence = definition.name(), "Sequence is gone, nothing to release");
                return Ok(());
            };
            let handle = self.cluster.owner_handle(registered.name())?;
            handle.release(&registered, &self.member, node_id).await
        }
    }
}

/// An in-process cluster: members, partition actors, backup replicas and a
/// sequence registry, enough to run the full lease protocol and its failover
/// without a network.
///
/// Members are addressed `127.0.0.1:5701`, `127.0.0.1:5702` and so on.
/// Partition `p` is owned by member `p % members`; the following members, in
/// ring order, are its backups.
///
/// Cloning is cheap and shares the cluster.
#[derive(Clone, Debug)]
pub struct LocalCluster {
    inner: Arc<ClusterInner>,
}

impl LocalCluster {
    /// Starts the members and one actor per partition.
    ///
    /// # Errors
    ///
    /// - [`Error::Configuration`] for an invalid `config`.
    /// - [`Error::Unavailable`] when called outside of a Tokio runtime.
    pub fn start(config: LocalClusterConfig) -> Result<Self> {
        config.validate()?;

        let members: Vec<_> = (0..config.members)
            .map(|i| MemberAddress::new(format!("127.0.0.1:{}", usize::from(BASE_PORT) + i)))
            .collect();
        let network = Arc::new(Network {
            replicas: members
                .iter()
                .map(|m| (m.clone(), Mutex::new(BackupReplica::new())))
                .collect(),
            unreachable: RwLock::new(HashSet::new()),
        });
        let mut placements = Vec::with_capacity(config.partition_count as usize);
        for partition in 0..config.partition_count {
            let owner_idx = partition as usize % members.len();
            let owner = members[owner_idx].clone();
            let backups: Vec<_> = (1..members.len())
                .map(|k| members[(owner_idx + k) % members.len()].clone())
                .take(MAX_BACKUP_COUNT)
                .collect();
            let channel = LocalBackupChannel {
                network: Arc::clone(&network),
                sender: owner.clone(),
            };
            let allocator =
                NodeIdAllocator::new(partition, channel).with_backups(backups.clone());
            let handle = PartitionHandle::spawn(allocator, config.request_buffer)?;
            placements.push(Placement {
                owner,
                backups,
                handle,
            });
        }

        info!(
            members = members.len(),
            partitions = config.partition_count,
            "Local cluster started"
        );
        Ok(Self {
            inner: Arc::new(ClusterInner {
                config,
                members,
                network,
                placements: RwLock::new(placements),
                registry: SequenceRegistry::new(),
                clock: MonotonicClock::new(),
                failover: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn registry(&self) -> &SequenceRegistry {
        &self.inner.registry
    }

    /// Every member address, including failed ones.
    pub fn members(&self) -> &[MemberAddress] {
        &self.inner.members
    }

    /// Members that have not failed.
    pub fn live_members(&self) -> Vec<MemberAddress> {
        self.inner.live_members()
    }

    /// The cluster's shared wall clock.
    pub fn clock(&self) -> &MonotonicClock {
        &self.inner.clock
    }

    /// Partition ownership of this cluster.
    pub fn router(&self) -> &impl PartitionRouter {
        &*self.inner
    }

    /// The [`LeaseService`] used by sequencers on `member`.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] if `member` is not part of the cluster.
    pub fn lease_client(&self, member: &MemberAddress) -> Result<MemberLeaseClient> {
        if !self.inner.members.contains(member) {
            return Err(Error::configuration(format!(
                "{member} is not a member of this cluster"
            )));
        }
        Ok(MemberLeaseClient {
            member: member.clone(),
            cluster: Arc::clone(&self.inner),
        })
    }

    /// Creates a detached sequencer for `sequence` on `member`, using the
    /// cluster clock.
    ///
    /// The sequencer follows the sequence's lifecycle: once the sequence is
    /// destroyed it moves to [`SequenceState::Destroyed`] by itself.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] for an unknown member,
    /// [`Error::UnknownSequence`] if the sequence does not exist and
    /// [`Error::Unavailable`] outside of a Tokio runtime.
    ///
    /// [`SequenceState::Destroyed`]: crate::SequenceState::Destroyed
    pub fn sequencer(&self, member: &MemberAddress, sequence: &str) -> Result<Arc<LocalSequencer>> {
        self.sequencer_with_clock(member, sequence, self.inner.clock.clone())
    }

    /// Like [`LocalCluster::sequencer`] with a caller-provided clock.
    ///
    /// # Errors
    ///
    /// See [`LocalCluster::sequencer`].
    pub fn sequencer_with_clock<T>(
        &self,
        member: &MemberAddress,
        sequence: &str,
        clock: T,
    ) -> Result<Arc<LocalSequencer<T>>>
    where
        T: TimeSource + Send + Sync + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::unavailable(format!("no Tokio runtime: {e}")))?;
        let lease = self.lease_client(member)?;
        let definition = self.inner.registry.sequence(sequence)?;
        let (registration, mut events) = self.inner.registry.register_channel(sequence)?;

        let sequencer = Arc::new(
            Sequencer::new(definition, lease, clock)
                .with_retry_interval(self.inner.config.retry_interval),
        );

        let watched: Weak<LocalSequencer<T>> = Arc::downgrade(&sequencer);
        let cluster = Arc::downgrade(&self.inner);
        runtime.spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SequenceEvent::Destroyed { sequence }) => {
                        if let Some(sequencer) = watched.upgrade() {
                            if sequencer.mark_destroyed() {
                                debug!(%sequence, "Sequencer destroyed with its sequence");
                            }
                        }
                        break;
                    }
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
            if let Some(cluster) = cluster.upgrade() {
                cluster.registry.deregister_channel(registration);
            }
        });

        Ok(sequencer)
    }

    /// Destroys a sequence cluster-wide: its allocation table is dropped on
    /// the owner and every backup, then every sequencer of the sequence is
    /// notified and moves to the destroyed state.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownSequence`], or the owner's error if the table could not
    /// be dropped everywhere (the sequence is then kept).
    #[instrument(level = "info", skip(self))]
    pub async fn destroy_sequence(&self, sequence: &str) -> Result<()> {
        self.inner.registry.sequence(sequence)?;
        let handle = self.inner.owner_handle(sequence)?;
        handle.drop_sequence(sequence).await?;
        self.inner.registry.remove_sequence(sequence)?;
        Ok(())
    }

    /// Frees every lease `member` holds, in every partition. Returns the
    /// number of ids freed.
    ///
    /// # Errors
    ///
    /// The first partition error; the other partitions are still processed.
    #[instrument(level = "info", skip(self), fields(member = %member))]
    pub async fn release_member(&self, member: &MemberAddress) -> Result<usize> {
        let handles: Vec<_> = self
            .inner
            .placements
            .read()
            .iter()
            .filter(|p| self.inner.network.is_reachable(&p.owner))
            .map(|p| p.handle.clone())
            .collect();

        let results =
            futures::future::join_all(handles.iter().map(|h| h.release_member(member))).await;
        let mut released = 0;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(n) => released += n,
                Err(e) => {
                    warn!(error = %e, "Failed to release member in partition");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(released),
        }
    }

    /// Fails `member`: it becomes unreachable, each partition it owned is
    /// taken over by its first live backup, and every partition it backed up
    /// gets a replacement backup. Leases the member held stay recorded until
    /// [`LocalCluster::release_member`] is called for it.
    ///
    /// Returns the partitions whose ownership moved.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] for an unknown member,
    /// [`Error::Unavailable`] if it already failed or is the last live member.
    #[instrument(level = "info", skip(self), fields(member = %member))]
    pub async fn fail_member(&self, member: &MemberAddress) -> Result<Vec<PartitionId>> {
        let _guard = self.inner.failover.lock().await;
        self.inner.check_member(member)?;
        if self.inner.live_members().len() == 1 {
            return Err(Error::unavailable(format!(
                "{member} is the last live member"
            )));
        }

        self.inner.network.unreachable.write().insert(member.clone());
        if let Some(replica) = self.inner.network.replicas.get(member) {
            *replica.lock() = BackupReplica::new();
        }
        let live = self.inner.live_members();

        let mut migrated = Vec::new();
        for partition in 0..self.inner.config.partition_count {
            let Some((owner, backups, handle)) = self.placement(partition) else {
                continue;
            };
            let lost_backup = backups.contains(member);
            let remaining: Vec<_> = backups.into_iter().filter(|b| b != member).collect();

            let (owner, handle, survivors) = if owner == *member {
                handle.abort();
                migrated.push(partition);
                match remaining.split_first() {
                    Some((promoted, rest)) => {
                        let snapshot = self
                            .inner
                            .network
                            .replicas
                            .get(promoted)
                            .map_or_else(
                                || PartitionSnapshot::new(partition),
                                |r| r.lock().promote(partition),
                            );
                        let handle = self.spawn_owner(partition, promoted, Some(snapshot))?;
                        info!(partition, new_owner = %promoted, "Backup promoted to owner");
                        (promoted.clone(), handle, rest.to_vec())
                    }
                    None => {
                        warn!(partition, "No live backup, allocation state is lost");
                        let successor = next_live(&self.inner.members, &live, &owner);
                        let handle = self.spawn_owner(partition, &successor, None)?;
                        (successor, handle, Vec::new())
                    }
                }
            } else if lost_backup {
                (owner, handle, remaining)
            } else {
                continue;
            };

            let wanted = backup_candidates(&self.inner.members, &live, &owner, survivors);
            let installed = handle.set_backups(wanted).await?;
            self.set_placement(partition, owner, installed, handle);
        }

        info!(migrated = migrated.len(), "Member failed");
        Ok(migrated)
    }

    /// Copy of the owner's allocation table of `sequence`.
    ///
    /// # Errors
    ///
    /// [`Error::Unavailable`] if the owner cannot be reached.
    pub async fn allocation_table(&self, sequence: &str) -> Result<Option<AllocationTable>> {
        let handle = self.inner.owner_handle(sequence)?;
        Ok(handle.snapshot().await?.tables.remove(sequence))
    }

    /// Copy of `member`'s backup table of `sequence`, if it holds one.
    pub fn backup_table(&self, member: &MemberAddress, sequence: &str) -> Option<AllocationTable> {
        let partition = self.inner.partition_of(sequence);
        self.inner
            .network
            .replicas
            .get(member)?
            .lock()
            .table(partition, sequence)
            .cloned()
    }

    /// Stops every partition actor. Outstanding sequencers fail with
    /// [`Error::Unavailable`] on their next lease operation.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self
            .inner
            .placements
            .read()
            .iter()
            .map(|p| p.handle.clone())
            .collect();
        for handle in handles {
            if let Err(e) = handle.shutdown().await {
                debug!(partition = handle.partition(), error = %e, "Partition already stopped");
            }
        }
        info!("Local cluster stopped");
    }

    fn placement(
        &self,
        partition: PartitionId,
    ) -> Option<(MemberAddress, Vec<MemberAddress>, PartitionHandle)> {
        self.inner
            .placements
            .read()
            .get(partition as usize)
            .map(|p| (p.owner.clone(), p.backups.clone(), p.handle.clone()))
    }

    fn set_placement(
        &self,
        partition: PartitionId,
        owner: MemberAddress,
        backups: Vec<MemberAddress>,
        handle: PartitionHandle,
    ) {
        if let Some(placement) = self.inner.placements.write().get_mut(partition as usize) {
            *placement = Placement {
                owner,
                backups,
                handle,
            };
        }
    }

    fn spawn_owner(
        &self,
        partition: PartitionId,
        owner: &MemberAddress,
        snapshot: Option<PartitionSnapshot>,
    ) -> Result<PartitionHandle> {
        let channel = LocalBackupChannel {
            network: Arc::clone(&self.inner.network),
            sender: owner.clone(),
        };
        let mut allocator = NodeIdAllocator::new(partition, channel);
        if let Some(snapshot) = snapshot {
            allocator.take_over_from_backup(snapshot);
        }
        PartitionHandle::spawn(allocator, self.inner.config.request_buffer)
    }
}

/// Members following `from` in ring order, i.e. by member index, wrapping
/// around. `from` itself is skipped.
fn ring_after<'a>(
    members: &'a [MemberAddress],
    from: &'a MemberAddress,
) -> impl Iterator<Item = &'a MemberAddress> {
    let start = members.iter().position(|m| m == from).map_or(0, |i| i + 1);
    members[start..]
        .iter()
        .chain(&members[..start])
        .filter(move |m| *m != from)
}

/// The first live member after `after` in ring order, or `after` itself.
fn next_live(
    members: &[MemberAddress],
    live: &[MemberAddress],
    after: &MemberAddress,
) -> MemberAddress {
    ring_after(members, after)
        .find(|m| live.contains(*m))
        .cloned()
        .unwrap_or_else(|| after.clone())
}

/// Keeps the surviving backups in order, then tops the list up with live
/// members that are neither owner nor backup yet, in ring order.
fn backup_candidates(
    members: &[MemberAddress],
    live: &[MemberAddress],
    owner: &MemberAddress,
    mut backups: Vec<MemberAddress>,
) -> Vec<MemberAddress> {
    for member in ring_after(members, owner).filter(|m| live.contains(*m)) {
        if backups.len() >= MAX_BACKUP_COUNT {
            break;
        }
        if !backups.contains(member) {
            backups.push(member.clone());
        }
    }
    backups
}
