use core::time::Duration;
use std::thread;

use portable_atomic::{AtomicU32, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{SleepProvider, TokioSleep, register::TimestampCounter};
use crate::{
    Error, IdGenStatus, LeaseService, LogicalNodeId, Result, SequenceDefinition, SequenceId,
    SequenceState, TimeSource, Transition,
    state::{Outcome, StateCell},
};

/// Pause between two attempts once a millisecond's counter space is used up.
pub const INCREMENT_RETRY_INTERVAL: Duration = Duration::from_micros(100);

const UNASSIGNED: u32 = u32::MAX;

/// A per-process generator bound to one named sequence.
///
/// A sequencer starts [`Detached`]. [`attach`] leases a logical node id from
/// the cluster through its [`LeaseService`]; from then on IDs are produced
/// entirely locally and lock-free until [`detach`] or [`destroy`] is called.
///
/// All shared state is atomic: the lifecycle state, the leased node id and a
/// packed `timestamp | counter` register. Any number of threads may share
/// one sequencer; each `(timestamp, counter)` pair is handed out at most once.
///
/// # Example
///
/// ```
/// use snowlease::{LocalCluster, LocalClusterConfig, SequenceDefinition, SequenceState};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let cluster = LocalCluster::start(LocalClusterConfig::default())?;
/// let definition = cluster.registry().create_sequence(
///     SequenceDefinition::builder("orders").build()?,
/// )?;
///
/// let member = cluster.members()[0].clone();
/// let sequencer = cluster.sequencer(&member, "orders")?;
/// sequencer.attach().await?;
/// assert_eq!(sequencer.state(), SequenceState::Attached);
///
/// let id = sequencer.next_id_async().await?;
/// assert_eq!(definition.node_id_of(id), sequencer.logical_node_id().unwrap());
///
/// sequencer.detach().await?;
/// # Ok::<_, snowlease::Error>(())
/// # }).unwrap();
/// ```
///
/// [`Detached`]: SequenceState::Detached
/// [`attach`]: Sequencer::attach
/// [`detach`]: Sequencer::detach
/// [`destroy`]: Sequencer::destroy
#[derive(Debug)]
pub struct Sequencer<L, T>
where
    L: LeaseService,
    T: TimeSource,
{
    definition: SequenceDefinition,
    lease: L,
    clock: T,
    state: StateCell,
    node_id: AtomicU32,
    register: TimestampCounter,
    retry_interval: Duration,
}

impl<L, T> Sequencer<L, T>
where
    L: LeaseService,
    T: TimeSource,
{
    /// Creates a detached sequencer for `definition`.
    pub fn new(definition: SequenceDefinition, lease: L, clock: T) -> Self {
        let register = TimestampCounter::new(definition.layout().counter_bits());
        Self {
            definition,
            lease,
            clock,
            state: StateCell::new(SequenceState::Detached),
            node_id: AtomicU32::new(UNASSIGNED),
            register,
            retry_interval: INCREMENT_RETRY_INTERVAL,
        }
    }

    /// Overrides [`INCREMENT_RETRY_INTERVAL`].
    #[must_use]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn sequence_name(&self) -> &str {
        self.definition.name()
    }

    pub const fn definition(&self) -> &SequenceDefinition {
        &self.definition
    }

    pub fn state(&self) -> SequenceState {
        self.state.load()
    }

    /// The currently leased logical node id, if any.
    #[allow(clippy::cast_possible_truncation)]
    pub fn logical_node_id(&self) -> Option<LogicalNodeId> {
        match self.node_id.load(Ordering::Acquire) {
            UNASSIGNED => None,
            raw => Some(raw as LogicalNodeId),
        }
    }

    /// Leases a logical node id and moves to [`SequenceState::Attached`].
    ///
    /// The sequencer is [`SequenceState::Attaching`] while the lease request
    /// is in flight; a concurrent attach or detach fails with
    /// [`Error::State`] instead of interleaving with it. Succeeds without
    /// effect once the sequencer is destroyed. A lease granted after a
    /// concurrent destroy is returned to the cluster.
    ///
    /// # Errors
    ///
    /// - [`Error::State`] if the sequencer is not detached.
    /// - [`Error::CapacityExhausted`], [`Error::Replication`] or
    ///   [`Error::Unavailable`] from the cluster. The state is reverted to
    ///   detached so the call can be retried.
    #[instrument(level = "debug", skip(self), fields(sequence = %self.sequence_name()))]
    pub async fn attach(&self) -> Result<()> {
        if self.state.transition(self.sequence_name(), SequenceState::Attaching)?
            == Outcome::Absorbed
        {
            return Ok(());
        }

        let node_id = match self.lease.acquire(&self.definition).await {
            Ok(node_id) => node_id,
            Err(e) => {
                self.state
                    .settle(SequenceState::Attaching, SequenceState::Detached);
                return Err(e);
            }
        };
        // Only the holder of `Attaching` publishes an id; every path back to
        // `Detached` clears it first.
        self.node_id.store(u32::from(node_id), Ordering::Release);

        if self
            .state
            .settle(SequenceState::Attaching, SequenceState::Attached)
        {
            debug!(node_id, "Attached to logical node");
            return Ok(());
        }

        // Destroyed while the lease request was in flight.
        self.release_assigned().await
    }

    /// Releases the leased logical node id and moves to
    /// [`SequenceState::Detached`], passing through
    /// [`SequenceState::Detaching`] while the release is in flight.
    ///
    /// Succeeds without effect once the sequencer is destroyed.
    ///
    /// # Errors
    ///
    /// - [`Error::State`] if the sequencer is not attached.
    /// - Any cluster error raised while releasing the lease. The sequencer
    ///   still ends up detached; the allocator accepts a repeated release.
    #[instrument(level = "debug", skip(self), fields(sequence = %self.sequence_name()))]
    pub async fn detach(&self) -> Result<()> {
        if self.state.transition(self.sequence_name(), SequenceState::Detaching)?
            == Outcome::Absorbed
        {
            return Ok(());
        }
        let released = self.release_assigned().await;
        self.state
            .settle(SequenceState::Detaching, SequenceState::Detached);
        released
    }

    /// Moves to the terminal [`SequenceState::Destroyed`] state, releasing the
    /// lease if one is held. Safe to call any number of times.
    ///
    /// # Errors
    ///
    /// Returns the cluster error if releasing a held lease fails. The
    /// sequencer is destroyed regardless.
    #[instrument(level = "debug", skip(self), fields(sequence = %self.sequence_name()))]
    pub async fn destroy(&self) -> Result<()> {
        if self.state.transition(self.sequence_name(), SequenceState::Destroyed)?
            == Outcome::Absorbed
        {
            return Ok(());
        }
        self.release_assigned().await
    }

    /// Moves to [`SequenceState::Destroyed`] without contacting the cluster.
    ///
    /// Used when the sequence itself was destroyed and its allocation state is
    /// already gone. Returns `true` if this call performed the transition.
    pub fn mark_destroyed(&self) -> bool {
        let applied = matches!(
            self.state
                .transition(self.sequence_name(), SequenceState::Destroyed),
            Ok(Outcome::Applied { .. })
        );
        self.node_id.store(UNASSIGNED, Ordering::Release);
        applied
    }

    async fn release_assigned(&self) -> Result<()> {
        let raw = self.node_id.swap(UNASSIGNED, Ordering::AcqRel);
        if raw == UNASSIGNED {
            return Ok(());
        }
        #[allow(clippy::cast_possible_truncation)]
        let node_id = raw as LogicalNodeId;
        match self.lease.release(&self.definition, node_id).await {
            Ok(()) => {
                debug!(node_id, "Released logical node");
                Ok(())
            }
            Err(e) => {
                warn!(node_id, error = %e, "Failed to release logical node");
                Err(e)
            }
        }
    }

    /// Makes one attempt at generating an ID without blocking.
    ///
    /// Reads the clock, rolls the register forward if the clock moved past
    /// the last seen timestamp, then tries to take the next counter value for
    /// that timestamp. Counter exhaustion and lost races are reported as
    /// [`IdGenStatus::Pending`], never as errors.
    ///
    /// # Errors
    ///
    /// - [`Error::NotAssigned`] if no logical node id is leased.
    /// - [`Error::State`] if the sequencer is not attached.
    /// - [`Error::Configuration`] if the clock has run past the largest
    ///   timestamp the layout can encode.
    pub fn try_next_id(&self) -> Result<IdGenStatus> {
        let node_id = self.check_state_and_node_id()?;
        let layout = self.definition.layout();

        let timestamp = self.definition.epoch().now(&self.clock);
        if timestamp > layout.max_timestamp() {
            return Err(Error::configuration(format!(
                "timestamp {timestamp} of sequence '{}' exceeds the {}-bit field",
                self.sequence_name(),
                layout.timestamp_bits()
            )));
        }

        self.register.advance(timestamp);
        match self
            .register
            .increment(timestamp, layout.max_millis_counter())
        {
            Some(counter) => Ok(IdGenStatus::Ready {
                id: layout.encode(timestamp, node_id, counter),
            }),
            None => Ok(IdGenStatus::Pending {
                yield_for: self.retry_interval,
            }),
        }
    }

    /// Generates the next ID, sleeping the current thread between attempts.
    ///
    /// # Errors
    ///
    /// See [`Sequencer::try_next_id`].
    pub fn next_id(&self) -> Result<SequenceId> {
        loop {
            match self.try_next_id()? {
                IdGenStatus::Ready { id } => return Ok(id),
                IdGenStatus::Pending { yield_for } => thread::sleep(yield_for),
            }
        }
    }

    /// Generates the next ID, waiting on the Tokio timer between attempts.
    ///
    /// # Errors
    ///
    /// See [`Sequencer::try_next_id`].
    pub async fn next_id_async(&self) -> Result<SequenceId> {
        self.next_id_with::<TokioSleep>().await
    }

    /// Generates the next ID using `S` to wait between attempts.
    ///
    /// # Errors
    ///
    /// See [`Sequencer::try_next_id`].
    pub async fn next_id_with<S: SleepProvider>(&self) -> Result<SequenceId> {
        loop {
            match self.try_next_id()? {
                IdGenStatus::Ready { id } => return Ok(id),
                IdGenStatus::Pending { yield_for } => S::sleep_for(yield_for).await,
            }
        }
    }

    /// Like [`Sequencer::next_id_async`], but gives up with
    /// [`Error::Cancelled`] if `token` is cancelled while waiting.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`], or any error of [`Sequencer::try_next_id`].
    pub async fn next_id_cancellable(&self, token: &CancellationToken) -> Result<SequenceId> {
        loop {
            match self.try_next_id()? {
                IdGenStatus::Ready { id } => return Ok(id),
                IdGenStatus::Pending { yield_for } => {
                    tokio::select! {
                        biased;
                        () = token.cancelled() => return Err(Error::Cancelled),
                        () = TokioSleep::sleep_for(yield_for) => {}
                    }
                }
            }
        }
    }

    /// Timestamp field of `id`, for IDs from any node of this sequence.
    pub fn timestamp_of(&self, id: SequenceId) -> u64 {
        self.definition.timestamp_of(id)
    }

    /// Logical node id field of `id`, for IDs from any node of this sequence.
    pub fn node_id_of(&self, id: SequenceId) -> LogicalNodeId {
        self.definition.node_id_of(id)
    }

    /// Counter field of `id`, for IDs from any node of this sequence.
    pub fn counter_of(&self, id: SequenceId) -> u32 {
        self.definition.counter_of(id)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn check_state_and_node_id(&self) -> Result<LogicalNodeId> {
        let raw = self.node_id.load(Ordering::Acquire);
        if raw == UNASSIGNED {
            return Err(Error::NotAssigned {
                sequence: self.sequence_name().to_owned(),
            });
        }
        let state = self.state();
        if state != SequenceState::Attached {
            return Err(Error::State {
                sequence: self.sequence_name().to_owned(),
                transition: Transition::Generate,
                actual: state,
            });
        }
        Ok(raw as LogicalNodeId)
    }
}
