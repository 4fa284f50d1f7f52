//! Error types for sequence definition, generation and lease allocation.
//!
//! ## Error Cases
//! - `Configuration`: a sequence definition or cluster setup is invalid.
//! - `State` / `NotAssigned`: an operation was called in the wrong
//!   [`SequenceState`]. Always recoverable by re-checking the state.
//! - `CapacityExhausted`: every logical node id of a sequence is leased.
//! - `Replication`: a required backup did not acknowledge a mutation. The
//!   mutation was rolled back on the owner.
//! - `Cancelled`: a blocking generation loop was aborted by the caller.
//!
//! [`SequenceState`]: crate::SequenceState

use crate::{MemberAddress, SequenceState};

/// A result type defaulting to this crate's [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Unified error type for sequencers, allocators and the cluster plumbing.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid sequence parameters or cluster configuration.
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// Illegal state transition for the sequence.
    #[error("Sequence '{sequence}' cannot {transition} while {actual}")]
    State {
        sequence: String,
        transition: Transition,
        actual: SequenceState,
    },

    /// An ID was requested from a sequencer without a leased logical node id.
    #[error("Sequence '{sequence}' has no logical node id assigned")]
    NotAssigned { sequence: String },

    /// Every logical node id of the sequence is currently leased.
    #[error("Sequence '{sequence}' has no free logical node id (max {max})")]
    CapacityExhausted { sequence: String, max: u32 },

    /// A backup failed to acknowledge a mutation; the mutation was rolled back.
    #[error("Replication of '{sequence}' to backup {backup} failed: {reason}")]
    Replication {
        sequence: String,
        backup: MemberAddress,
        reason: String,
    },

    /// The caller aborted a blocking generation loop.
    #[error("ID generation cancelled")]
    Cancelled,

    /// The sequence was never created or has been destroyed on the cluster.
    #[error("Unknown sequence '{sequence}'")]
    UnknownSequence { sequence: String },

    /// A member, partition or internal channel is not reachable.
    #[error("Unavailable: {context}")]
    Unavailable { context: String },
}

impl Error {
    /// Returns `true` for the errors caused by calling an operation in the
    /// wrong sequence state.
    pub const fn is_state_error(&self) -> bool {
        matches!(self, Self::State { .. } | Self::NotAssigned { .. })
    }

    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub(crate) fn unavailable(context: impl Into<String>) -> Self {
        Self::Unavailable {
            context: context.into(),
        }
    }
}

/// A requested sequencer state transition, used in [`Error::State`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transition {
    Attach,
    Detach,
    Generate,
}

impl core::fmt::Display for Transition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Attach => f.write_str("attach"),
            Self::Detach => f.write_str("detach"),
            Self::Generate => f.write_str("generate"),
        }
    }
}
