use core::{
    future::{Future, ready},
    time::Duration,
};
use std::{
    collections::HashSet,
    sync::Arc,
    thread::{self, scope},
};

use parking_lot::Mutex;
use portable_atomic::{AtomicBool, AtomicU16, Ordering};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{
    Epoch, Error, IdGenStatus, LeaseService, LogicalNodeId, ManualClock, MonotonicClock, Result,
    SequenceDefinition, SequenceId, SequenceState, Sequencer, TimeSource, TokioYield, Transition,
};

const EPOCH_MILLIS: u64 = 1_700_000_000_000;

/// Hands out consecutive ids and records releases.
#[derive(Debug, Default)]
struct MockLease {
    next: AtomicU16,
    released: Mutex<Vec<LogicalNodeId>>,
    fail: AtomicBool,
}

impl MockLease {
    fn starting_at(id: LogicalNodeId) -> Arc<Self> {
        Arc::new(Self {
            next: AtomicU16::new(id),
            ..Self::default()
        })
    }

    fn released(&self) -> Vec<LogicalNodeId> {
        self.released.lock().clone()
    }
}

impl LeaseService for MockLease {
    fn acquire(
        &self,
        definition: &SequenceDefinition,
    ) -> impl Future<Output = Result<LogicalNodeId>> + Send {
        let result = if self.fail.load(Ordering::Acquire) {
            Err(Error::CapacityExhausted {
                sequence: definition.name().to_owned(),
                max: definition.max_logical_node_count(),
            })
        } else {
            Ok(self.next.fetch_add(1, Ordering::AcqRel))
        };
        ready(result)
    }

    fn release(
        &self,
        _definition: &SequenceDefinition,
        node_id: LogicalNodeId,
    ) -> impl Future<Output = Result<()>> + Send {
        self.released.lock().push(node_id);
        ready(Ok(()))
    }
}

/// Holds every lease request until the test opens the gate for it.
#[derive(Debug)]
struct GatedLease {
    entered: Semaphore,
    gate: Semaphore,
    next: AtomicU16,
    fail: AtomicBool,
    granted: Mutex<Vec<LogicalNodeId>>,
    released: Mutex<Vec<LogicalNodeId>>,
}

impl GatedLease {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: Semaphore::new(0),
            gate: Semaphore::new(0),
            next: AtomicU16::new(0),
            fail: AtomicBool::new(false),
            granted: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
        })
    }

    /// Waits until a lease request is parked at the gate.
    async fn wait_for_request(&self) {
        self.entered.acquire().await.unwrap().forget();
    }

    fn open(&self) {
        self.gate.add_permits(1);
    }

    fn granted(&self) -> Vec<LogicalNodeId> {
        self.granted.lock().clone()
    }

    fn released(&self) -> Vec<LogicalNodeId> {
        self.released.lock().clone()
    }
}

impl LeaseService for GatedLease {
    fn acquire(
        &self,
        definition: &SequenceDefinition,
    ) -> impl Future<Output = Result<LogicalNodeId>> + Send {
        let exhausted = Error::CapacityExhausted {
            sequence: definition.name().to_owned(),
            max: definition.max_logical_node_count(),
        };
        async move {
            self.entered.add_permits(1);
            self.gate
                .acquire()
                .await
                .map_err(|_| Error::unavailable("lease gate closed"))?
                .forget();
            if self.fail.load(Ordering::Acquire) {
                return Err(exhausted);
            }
            let id = self.next.fetch_add(1, Ordering::AcqRel);
            self.granted.lock().push(id);
            Ok(id)
        }
    }

    fn release(
        &self,
        _definition: &SequenceDefinition,
        node_id: LogicalNodeId,
    ) -> impl Future<Output = Result<()>> + Send {
        self.released.lock().push(node_id);
        ready(Ok(()))
    }
}

type GatedSequencer = Arc<Sequencer<Arc<GatedLease>, ManualClock>>;

fn gated_sequencer(lease: &Arc<GatedLease>) -> GatedSequencer {
    Arc::new(Sequencer::new(
        definition(12),
        Arc::clone(lease),
        frozen_clock(),
    ))
}

fn spawn_attach(seq: &GatedSequencer) -> tokio::task::JoinHandle<Result<()>> {
    let seq = Arc::clone(seq);
    tokio::spawn(async move { seq.attach().await })
}

fn definition(counter_bits: u32) -> SequenceDefinition {
    SequenceDefinition::builder("orders")
        .epoch(Epoch::from_unix_millis(EPOCH_MILLIS))
        .max_logical_node_count(16)
        .counter_bits(counter_bits)
        .build()
        .unwrap()
}

fn sequencer<T: TimeSource>(
    lease: &Arc<MockLease>,
    counter_bits: u32,
    clock: T,
) -> Sequencer<Arc<MockLease>, T> {
    Sequencer::new(definition(counter_bits), Arc::clone(lease), clock)
        .with_retry_interval(Duration::from_millis(1))
}

fn frozen_clock() -> ManualClock {
    ManualClock::new(EPOCH_MILLIS + 1_000)
}

fn ready_id(status: IdGenStatus) -> SequenceId {
    match status {
        IdGenStatus::Ready { id } => id,
        IdGenStatus::Pending { .. } => panic!("expected an ID, got {status:?}"),
    }
}

#[test]
fn starts_detached_without_a_node_id() {
    let lease = MockLease::starting_at(0);
    let seq = sequencer(&lease, 12, frozen_clock());
    assert_eq!(seq.state(), SequenceState::Detached);
    assert_eq!(seq.logical_node_id(), None);

    let err = seq.try_next_id().unwrap_err();
    assert_eq!(
        err,
        Error::NotAssigned {
            sequence: "orders".into()
        }
    );
    assert!(err.is_state_error());
    assert!(seq.next_id().is_err());
}

#[tokio::test]
async fn attach_then_generate_locally() {
    let lease = MockLease::starting_at(5);
    let seq = sequencer(&lease, 12, frozen_clock());
    seq.attach().await.unwrap();
    assert_eq!(seq.state(), SequenceState::Attached);
    assert_eq!(seq.logical_node_id(), Some(5));

    let ids: Vec<_> = (0..3).map(|_| seq.next_id().unwrap()).collect();
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(seq.timestamp_of(*id), 1_000);
        assert_eq!(seq.node_id_of(*id), 5);
        assert_eq!(seq.counter_of(*id), i as u32 + 1);
    }
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn repeated_attach_or_detach_is_a_state_error() {
    let lease = MockLease::starting_at(0);
    let seq = sequencer(&lease, 12, frozen_clock());

    assert_eq!(
        seq.detach().await,
        Err(Error::State {
            sequence: "orders".into(),
            transition: Transition::Detach,
            actual: SequenceState::Detached,
        })
    );

    seq.attach().await.unwrap();
    let err = seq.attach().await.unwrap_err();
    assert!(err.is_state_error());
    assert_eq!(seq.logical_node_id(), Some(0));

    seq.detach().await.unwrap();
    assert!(seq.detach().await.unwrap_err().is_state_error());
    assert_eq!(lease.released(), vec![0]);
}

#[tokio::test]
async fn detach_releases_and_stops_generation() {
    let lease = MockLease::starting_at(3);
    let seq = sequencer(&lease, 12, frozen_clock());
    seq.attach().await.unwrap();
    seq.next_id().unwrap();

    seq.detach().await.unwrap();
    assert_eq!(seq.state(), SequenceState::Detached);
    assert_eq!(seq.logical_node_id(), None);
    assert_eq!(lease.released(), vec![3]);
    assert!(matches!(seq.try_next_id(), Err(Error::NotAssigned { .. })));

    // Reattaching leases a fresh id.
    seq.attach().await.unwrap();
    assert_eq!(seq.logical_node_id(), Some(4));
}

#[tokio::test]
async fn failed_attach_returns_to_detached() {
    let lease = MockLease::starting_at(0);
    lease.fail.store(true, Ordering::Release);
    let seq = sequencer(&lease, 12, frozen_clock());

    assert!(matches!(
        seq.attach().await,
        Err(Error::CapacityExhausted { max: 16, .. })
    ));
    assert_eq!(seq.state(), SequenceState::Detached);
    assert_eq!(seq.logical_node_id(), None);

    lease.fail.store(false, Ordering::Release);
    seq.attach().await.unwrap();
    assert_eq!(seq.state(), SequenceState::Attached);
}

#[tokio::test]
async fn attach_and_detach_fail_while_an_attach_is_in_flight() {
    let lease = GatedLease::new();
    let seq = gated_sequencer(&lease);

    let first = spawn_attach(&seq);
    lease.wait_for_request().await;
    assert_eq!(seq.state(), SequenceState::Attaching);

    assert_eq!(
        seq.detach().await,
        Err(Error::State {
            sequence: "orders".into(),
            transition: Transition::Detach,
            actual: SequenceState::Attaching,
        })
    );
    assert_eq!(
        seq.attach().await,
        Err(Error::State {
            sequence: "orders".into(),
            transition: Transition::Attach,
            actual: SequenceState::Attaching,
        })
    );
    assert!(seq.try_next_id().unwrap_err().is_state_error());

    lease.open();
    first.await.unwrap().unwrap();
    assert_eq!(seq.state(), SequenceState::Attached);
    assert_eq!(seq.logical_node_id(), Some(0));

    seq.detach().await.unwrap();
    assert_eq!(lease.granted(), vec![0]);
    assert_eq!(lease.released(), lease.granted());
}

#[tokio::test]
async fn failed_attach_in_flight_leaves_no_lease_behind() {
    let lease = GatedLease::new();
    lease.fail.store(true, Ordering::Release);
    let seq = gated_sequencer(&lease);

    let first = spawn_attach(&seq);
    lease.wait_for_request().await;
    assert!(seq.attach().await.unwrap_err().is_state_error());

    lease.open();
    assert!(matches!(
        first.await.unwrap(),
        Err(Error::CapacityExhausted { .. })
    ));
    assert_eq!(seq.state(), SequenceState::Detached);
    assert_eq!(seq.logical_node_id(), None);

    lease.fail.store(false, Ordering::Release);
    let retry = spawn_attach(&seq);
    lease.wait_for_request().await;
    lease.open();
    retry.await.unwrap().unwrap();
    assert_eq!(seq.state(), SequenceState::Attached);

    seq.detach().await.unwrap();
    assert_eq!(lease.granted(), vec![0]);
    assert_eq!(lease.released(), vec![0]);
}

#[tokio::test]
async fn destroy_during_attach_returns_the_late_lease() {
    let lease = GatedLease::new();
    let seq = gated_sequencer(&lease);

    let first = spawn_attach(&seq);
    lease.wait_for_request().await;
    seq.destroy().await.unwrap();
    assert!(lease.released().is_empty());

    lease.open();
    first.await.unwrap().unwrap();
    assert_eq!(seq.state(), SequenceState::Destroyed);
    assert_eq!(seq.logical_node_id(), None);
    assert_eq!(lease.granted(), vec![0]);
    assert_eq!(lease.released(), vec![0]);
}

#[tokio::test]
async fn destroyed_absorbs_every_transition() {
    let lease = MockLease::starting_at(2);
    let seq = sequencer(&lease, 12, frozen_clock());
    seq.attach().await.unwrap();

    seq.destroy().await.unwrap();
    assert_eq!(seq.state(), SequenceState::Destroyed);
    assert_eq!(lease.released(), vec![2]);

    seq.attach().await.unwrap();
    seq.detach().await.unwrap();
    seq.destroy().await.unwrap();
    assert_eq!(seq.state(), SequenceState::Destroyed);
    assert_eq!(lease.released(), vec![2]);
    assert!(seq.try_next_id().unwrap_err().is_state_error());
}

#[tokio::test]
async fn mark_destroyed_skips_the_cluster() {
    let lease = MockLease::starting_at(0);
    let seq = sequencer(&lease, 12, frozen_clock());
    seq.attach().await.unwrap();

    assert!(seq.mark_destroyed());
    assert!(!seq.mark_destroyed());
    assert_eq!(seq.state(), SequenceState::Destroyed);
    assert_eq!(seq.logical_node_id(), None);
    assert!(lease.released().is_empty());
}

#[tokio::test]
async fn exhausted_millisecond_is_pending_until_the_clock_moves() {
    let clock = frozen_clock();
    let lease = MockLease::starting_at(1);
    let seq = sequencer(&lease, 2, clock.clone());
    seq.attach().await.unwrap();

    let counters: Vec<_> = (0..3)
        .map(|_| seq.counter_of(ready_id(seq.try_next_id().unwrap())))
        .collect();
    assert_eq!(counters, vec![1, 2, 3]);
    assert_eq!(
        seq.try_next_id().unwrap(),
        IdGenStatus::Pending {
            yield_for: Duration::from_millis(1)
        }
    );

    clock.advance(1);
    let id = ready_id(seq.try_next_id().unwrap());
    assert_eq!(seq.timestamp_of(id), 1_001);
    assert_eq!(seq.counter_of(id), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn next_id_async_waits_for_the_next_millisecond() {
    let clock = frozen_clock();
    let lease = MockLease::starting_at(1);
    let seq = Arc::new(sequencer(&lease, 2, clock.clone()));
    seq.attach().await.unwrap();
    for _ in 0..3 {
        seq.next_id_async().await.unwrap();
    }

    let waiter = tokio::spawn({
        let seq = Arc::clone(&seq);
        async move { seq.next_id_async().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    clock.advance(1);
    let id = waiter.await.unwrap().unwrap();
    assert_eq!(seq.timestamp_of(id), 1_001);
    assert_eq!(seq.counter_of(id), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn yielding_provider_retries_until_the_clock_moves() {
    let clock = frozen_clock();
    let lease = MockLease::starting_at(2);
    let seq = Arc::new(sequencer(&lease, 1, clock.clone()));
    seq.attach().await.unwrap();
    let first = seq.next_id_with::<TokioYield>().await.unwrap();
    assert_eq!(seq.counter_of(first), 1);

    let waiter = tokio::spawn({
        let seq = Arc::clone(&seq);
        async move { seq.next_id_with::<TokioYield>().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!waiter.is_finished());

    clock.advance(1);
    let id = waiter.await.unwrap().unwrap();
    assert_eq!(seq.timestamp_of(id), 1_001);
    assert_eq!(seq.node_id_of(id), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_aborts_a_waiting_generation() {
    let lease = MockLease::starting_at(0);
    let seq = sequencer(&lease, 1, frozen_clock());
    seq.attach().await.unwrap();
    seq.next_id_async().await.unwrap();

    let token = CancellationToken::new();
    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        })
    };
    assert_eq!(seq.next_id_cancellable(&token).await, Err(Error::Cancelled));
    canceller.await.unwrap();

    // A ready ID is returned even with a cancelled token.
    let other = sequencer(&MockLease::starting_at(1), 1, frozen_clock());
    other.attach().await.unwrap();
    assert!(other.next_id_cancellable(&token).await.is_ok());
}

#[tokio::test]
async fn clock_before_epoch_clamps_to_zero() {
    let lease = MockLease::starting_at(0);
    let seq = sequencer(&lease, 12, ManualClock::new(EPOCH_MILLIS - 5_000));
    seq.attach().await.unwrap();
    assert_eq!(seq.timestamp_of(seq.next_id().unwrap()), 0);
}

#[tokio::test]
async fn timestamp_overflow_is_a_configuration_error() {
    let definition = SequenceDefinition::builder("wide")
        .epoch(Epoch::from_unix_millis(0))
        .max_logical_node_count(1 << 16)
        .counter_bits(11)
        .build()
        .unwrap();
    let max = definition.layout().max_timestamp();
    let clock = ManualClock::new(max);
    let seq = Sequencer::new(definition, MockLease::starting_at(0), clock.clone());
    seq.attach().await.unwrap();

    assert_eq!(seq.timestamp_of(seq.next_id().unwrap()), max);
    clock.advance(1);
    assert!(matches!(
        seq.try_next_id(),
        Err(Error::Configuration { .. })
    ));
}

#[tokio::test]
async fn distinct_nodes_never_collide() {
    let clock = frozen_clock();
    let a = sequencer(&MockLease::starting_at(0), 4, clock.clone());
    let b = sequencer(&MockLease::starting_at(1), 4, clock.clone());
    a.attach().await.unwrap();
    b.attach().await.unwrap();

    let mut seen = HashSet::new();
    for _ in 0..5 {
        for _ in 0..15 {
            assert!(seen.insert(a.next_id().unwrap()));
            assert!(seen.insert(b.next_id().unwrap()));
        }
        clock.advance(1);
    }
    assert_eq!(seen.len(), 150);
}

#[test]
fn concurrent_generation_is_unique_and_monotonic_per_thread() {
    const PER_THREAD: usize = 5_000;
    let threads = num_cpus::get().clamp(2, 8);

    let lease = MockLease::starting_at(7);
    let seq = sequencer(&lease, 12, MonotonicClock::new());
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
        .block_on(seq.attach())
        .unwrap();

    let all: Vec<Vec<SequenceId>> = scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                s.spawn(|| {
                    (0..PER_THREAD)
                        .map(|_| seq.next_id().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut seen = HashSet::with_capacity(threads * PER_THREAD);
    for ids in &all {
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        for id in ids {
            assert_eq!(seq.node_id_of(*id), 7);
            assert!(seen.insert(*id), "duplicate {id}");
        }
    }
    assert_eq!(seen.len(), threads * PER_THREAD);
}

#[test]
fn blocking_next_id_resumes_after_the_clock_moves() {
    let clock = frozen_clock();
    let lease = MockLease::starting_at(0);
    let seq = sequencer(&lease, 1, clock.clone());
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
        .block_on(seq.attach())
        .unwrap();
    seq.next_id().unwrap();

    let id = scope(|s| {
        let waiter = s.spawn(|| seq.next_id().unwrap());
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        clock.advance(1);
        waiter.join().unwrap()
    });
    assert_eq!(seq.timestamp_of(id), 1_001);
}
