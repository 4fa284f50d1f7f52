use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::{LogicalNodeId, MemberAddress, Mutation, MutationKind, PartitionId};

/// Authoritative mapping of a sequence's leased logical node ids to the
/// members holding them.
///
/// A reverse index keeps member lookups cheap for release-on-departure.
/// Both maps are updated together; only the forward map is serialized.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(
        from = "BTreeMap<LogicalNodeId, MemberAddress>",
        into = "BTreeMap<LogicalNodeId, MemberAddress>"
    )
)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocationTable {
    holders: BTreeMap<LogicalNodeId, MemberAddress>,
    by_member: HashMap<MemberAddress, BTreeSet<LogicalNodeId>>,
}

impl AllocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }

    /// The member holding `node_id`, if it is leased.
    pub fn holder(&self, node_id: LogicalNodeId) -> Option<&MemberAddress> {
        self.holders.get(&node_id)
    }

    /// Ids held by `address`, ascending.
    pub fn ids_of(&self, address: &MemberAddress) -> Vec<LogicalNodeId> {
        self.by_member
            .get(address)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (LogicalNodeId, &MemberAddress)> {
        self.holders.iter().map(|(id, address)| (*id, address))
    }

    /// Lowest id in `0..max_count` that is not leased.
    #[allow(clippy::cast_possible_truncation)]
    pub fn lowest_free(&self, max_count: u32) -> Option<LogicalNodeId> {
        let mut candidate: u32 = 0;
        for id in self.holders.keys() {
            let id = u32::from(*id);
            if id > candidate {
                break;
            }
            candidate = id + 1;
        }
        (candidate < max_count).then_some(candidate as LogicalNodeId)
    }

    /// Records `address` as the holder of `node_id`, replacing any previous
    /// holder, which is returned.
    pub fn insert(&mut self, node_id: LogicalNodeId, address: MemberAddress) -> Option<MemberAddress> {
        let previous = self.holders.insert(node_id, address.clone());
        if let Some(previous) = &previous {
            self.unindex(previous, node_id);
        }
        self.by_member.entry(address).or_default().insert(node_id);
        previous
    }

    /// Frees `node_id` if `address` holds it. Returns `true` if it did.
    pub fn remove_held(&mut self, node_id: LogicalNodeId, address: &MemberAddress) -> bool {
        if self.holders.get(&node_id) != Some(address) {
            return false;
        }
        self.holders.remove(&node_id);
        self.unindex(address, node_id);
        true
    }

    /// Frees every id held by `address` and returns them.
    pub fn remove_member(&mut self, address: &MemberAddress) -> Vec<LogicalNodeId> {
        let ids: Vec<_> = self
            .by_member
            .remove(address)
            .map(|ids| ids.into_iter().collect())
            .unwrap_or_default();
        for id in &ids {
            self.holders.remove(id);
        }
        ids
    }

    /// Applies a replicated mutation. Returns `true` if the table changed;
    /// replaying an already applied mutation is a no-op.
    pub fn apply(&mut self, mutation: &Mutation) -> bool {
        match mutation.kind {
            MutationKind::Allocate => {
                if self.holders.get(&mutation.node_id) == Some(&mutation.address) {
                    return false;
                }
                self.insert(mutation.node_id, mutation.address.clone());
                true
            }
            MutationKind::Release => self.remove_held(mutation.node_id, &mutation.address),
        }
    }

    fn unindex(&mut self, address: &MemberAddress, node_id: LogicalNodeId) {
        if let Some(ids) = self.by_member.get_mut(address) {
            ids.remove(&node_id);
            if ids.is_empty() {
                self.by_member.remove(address);
            }
        }
    }
}

impl From<BTreeMap<LogicalNodeId, MemberAddress>> for AllocationTable {
    fn from(holders: BTreeMap<LogicalNodeId, MemberAddress>) -> Self {
        let mut by_member: HashMap<MemberAddress, BTreeSet<LogicalNodeId>> = HashMap::new();
        for (id, address) in &holders {
            by_member.entry(address.clone()).or_default().insert(*id);
        }
        Self { holders, by_member }
    }
}

impl From<AllocationTable> for BTreeMap<LogicalNodeId, MemberAddress> {
    fn from(table: AllocationTable) -> Self {
        table.holders
    }
}

/// Full allocation state of one partition: every sequence's table.
///
/// Exchanged on backup promotion and when a member newly becomes a backup.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionSnapshot {
    pub partition: PartitionId,
    pub tables: BTreeMap<String, AllocationTable>,
}

impl PartitionSnapshot {
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            tables: BTreeMap::new(),
        }
    }

    pub fn table(&self, sequence: &str) -> Option<&AllocationTable> {
        self.tables.get(sequence)
    }
}
