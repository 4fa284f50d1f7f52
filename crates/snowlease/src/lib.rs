//! Cluster-wide, roughly time-ordered 64-bit IDs.
//!
//! Each [`Sequencer`] leases a small logical node id for its sequence from
//! the member owning the sequence's partition, then generates IDs locally
//! and lock-free. The lease table of every partition is replicated
//! synchronously to backups, so a failed owner is replaced without ever
//! handing the same node id to two live generators.

mod allocation;
mod cluster;
mod definition;
mod error;
mod layout;
mod sequencer;
mod state;
mod status;
mod time;

pub use crate::allocation::*;
pub use crate::cluster::*;
pub use crate::definition::*;
pub use crate::error::*;
pub use crate::layout::*;
pub use crate::sequencer::*;
pub use crate::state::SequenceState;
pub use crate::status::*;
pub use crate::time::*;
