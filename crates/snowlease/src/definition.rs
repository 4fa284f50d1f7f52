use std::sync::Arc;

use crate::{BitLayout, DEFAULT_COUNTER_BITS, Epoch, Error, Result, SequenceId};

/// A logical node id leased to one cluster member for one sequence.
pub type LogicalNodeId = u16;

/// Default number of logical node ids per sequence (10 node bits).
pub const DEFAULT_MAX_LOGICAL_NODE_COUNT: u32 = 1024;

/// Default number of synchronous backups of a sequence's allocation state.
pub const DEFAULT_BACKUP_COUNT: usize = 1;

/// Upper bound on synchronous backups.
pub const MAX_BACKUP_COUNT: usize = 6;

/// Immutable description of a named sequence.
///
/// Created once through the [`SequenceRegistry`] and shared read-only by the
/// sequencers, allocators and replicas referencing the name. Cloning is cheap.
///
/// [`SequenceRegistry`]: crate::SequenceRegistry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceDefinition {
    inner: Arc<DefinitionInner>,
}

#[derive(Debug, PartialEq, Eq)]
struct DefinitionInner {
    name: String,
    epoch: Epoch,
    max_logical_node_count: u32,
    backup_count: usize,
    layout: BitLayout,
}

impl SequenceDefinition {
    /// Validates and creates a definition using [`DEFAULT_COUNTER_BITS`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] on an empty name, an invalid bit
    /// layout or a backup count above [`MAX_BACKUP_COUNT`].
    pub fn new(
        name: impl Into<String>,
        epoch: Epoch,
        max_logical_node_count: u32,
        backup_count: usize,
    ) -> Result<Self> {
        Self::builder(name)
            .epoch(epoch)
            .max_logical_node_count(max_logical_node_count)
            .backup_count(backup_count)
            .build()
    }

    pub fn builder(name: impl Into<String>) -> SequenceDefinitionBuilder {
        SequenceDefinitionBuilder {
            name: name.into(),
            epoch: Epoch::default(),
            max_logical_node_count: DEFAULT_MAX_LOGICAL_NODE_COUNT,
            counter_bits: DEFAULT_COUNTER_BITS,
            backup_count: DEFAULT_BACKUP_COUNT,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn epoch(&self) -> Epoch {
        self.inner.epoch
    }

    pub fn max_logical_node_count(&self) -> u32 {
        self.inner.max_logical_node_count
    }

    pub fn backup_count(&self) -> usize {
        self.inner.backup_count
    }

    pub fn layout(&self) -> &BitLayout {
        &self.inner.layout
    }

    /// Timestamp field of an ID produced by any node of this sequence.
    pub fn timestamp_of(&self, id: SequenceId) -> u64 {
        self.inner.layout.timestamp_of(id)
    }

    /// Logical node id field of an ID produced by any node of this sequence.
    pub fn node_id_of(&self, id: SequenceId) -> LogicalNodeId {
        self.inner.layout.node_id_of(id)
    }

    /// Counter field of an ID produced by any node of this sequence.
    pub fn counter_of(&self, id: SequenceId) -> u32 {
        self.inner.layout.counter_of(id)
    }
}

/// Builder for [`SequenceDefinition`]. See [`SequenceDefinition::builder`].
#[derive(Clone, Debug)]
#[must_use]
pub struct SequenceDefinitionBuilder {
    name: String,
    epoch: Epoch,
    max_logical_node_count: u32,
    counter_bits: u32,
    backup_count: usize,
}

impl SequenceDefinitionBuilder {
    pub fn epoch(mut self, epoch: Epoch) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn max_logical_node_count(mut self, count: u32) -> Self {
        self.max_logical_node_count = count;
        self
    }

    /// Width of the per-millisecond counter field.
    pub fn counter_bits(mut self, bits: u32) -> Self {
        self.counter_bits = bits;
        self
    }

    pub fn backup_count(mut self, count: usize) -> Self {
        self.backup_count = count;
        self
    }

    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if any parameter is invalid.
    pub fn build(self) -> Result<SequenceDefinition> {
        if self.name.trim().is_empty() {
            return Err(Error::configuration("sequence name must not be empty"));
        }
        if self.backup_count > MAX_BACKUP_COUNT {
            return Err(Error::configuration(format!(
                "backup_count must be at most {MAX_BACKUP_COUNT}, got {}",
                self.backup_count
            )));
        }
        let layout = BitLayout::new(self.max_logical_node_count, self.counter_bits)?;

        Ok(SequenceDefinition {
            inner: Arc::new(DefinitionInner {
                name: self.name,
                epoch: self.epoch,
                max_logical_node_count: self.max_logical_node_count,
                backup_count: self.backup_count,
                layout,
            }),
        })
    }
}
