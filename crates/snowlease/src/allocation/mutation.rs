use crate::{LogicalNodeId, MemberAddress, PartitionSnapshot};

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Allocate,
    Release,
}

/// One change to a sequence's allocation table, as shipped to backups.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Mutation {
    pub sequence: String,
    pub node_id: LogicalNodeId,
    pub address: MemberAddress,
    pub kind: MutationKind,
}

impl Mutation {
    pub fn allocate(sequence: impl Into<String>, node_id: LogicalNodeId, address: MemberAddress) -> Self {
        Self {
            sequence: sequence.into(),
            node_id,
            address,
            kind: MutationKind::Allocate,
        }
    }

    pub fn release(sequence: impl Into<String>, node_id: LogicalNodeId, address: MemberAddress) -> Self {
        Self {
            sequence: sequence.into(),
            node_id,
            address,
            kind: MutationKind::Release,
        }
    }

    /// The mutation undoing this one.
    #[must_use]
    pub fn inverse(&self) -> Self {
        let kind = match self.kind {
            MutationKind::Allocate => MutationKind::Release,
            MutationKind::Release => MutationKind::Allocate,
        };
        Self {
            kind,
            ..self.clone()
        }
    }
}

/// Operations a partition owner sends to its backups.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackupOperation {
    /// Apply a single allocation table change.
    Apply(Mutation),
    /// Forget all allocation state of a destroyed sequence.
    DropSequence { sequence: String },
    /// Free every id a departed member holds, across all sequences.
    ReleaseMember { address: MemberAddress },
    /// Replace the backup's copy of the partition with the owner's state.
    /// Sent when a member newly becomes a backup.
    Sync(PartitionSnapshot),
}

impl BackupOperation {
    /// Name of the affected sequence, if the operation targets one.
    pub fn sequence(&self) -> Option<&str> {
        match self {
            Self::Apply(mutation) => Some(&mutation.sequence),
            Self::DropSequence { sequence } => Some(sequence),
            Self::ReleaseMember { .. } | Self::Sync(_) => None,
        }
    }
}
