use core::{
    future::{Future, ready},
    hint::black_box,
};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use snowlease::{
    IdGenStatus, LeaseService, LocalCluster, LocalClusterConfig, LogicalNodeId, MonotonicClock,
    Result, SequenceDefinition, Sequencer, SleepProvider, TimeSource, TokioSleep, TokioYield,
};
use std::{
    sync::{Arc, Barrier},
    thread::scope,
    time::Instant,
};
use tokio::runtime::{Builder, Runtime};

struct FixedMockTime {
    millis: u64,
}

impl TimeSource for FixedMockTime {
    fn current_millis(&self) -> u64 {
        self.millis
    }
}

/// Always leases node 0; keeps the cluster out of generation benchmarks.
struct FixedLease;

impl LeaseService for FixedLease {
    fn acquire(
        &self,
        _definition: &SequenceDefinition,
    ) -> impl Future<Output = Result<LogicalNodeId>> + Send {
        ready(Ok(0))
    }

    fn release(
        &self,
        _definition: &SequenceDefinition,
        _node_id: LogicalNodeId,
    ) -> impl Future<Output = Result<()>> + Send {
        ready(Ok(()))
    }
}

// One full millisecond of the default 12-bit counter.
const TOTAL_IDS: usize = 4095;

fn runtime() -> Runtime {
    Builder::new_multi_thread()
        .enable_all()
        .worker_threads(1)
        .build()
        .unwrap()
}

fn attached<T: TimeSource>(rt: &Runtime, clock: T) -> Sequencer<FixedLease, T> {
    let definition = SequenceDefinition::builder("bench").build().unwrap();
    let sequencer = Sequencer::new(definition, FixedLease, clock);
    rt.block_on(sequencer.attach()).unwrap();
    sequencer
}

/// Hot path with a fixed clock: every attempt is `Ready`.
fn benchmark_mock_sequential(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("mock/sequential");
    group.throughput(Throughput::Elements(TOTAL_IDS as u64));

    group.bench_function(format!("elems/{TOTAL_IDS}"), |b| {
        b.iter_custom(|iters| {
            let mut elapsed = core::time::Duration::ZERO;
            for _ in 0..iters {
                let sequencer = attached(&rt, FixedMockTime { millis: 1 });
                let start = Instant::now();
                for _ in 0..TOTAL_IDS {
                    match sequencer.try_next_id().unwrap() {
                        IdGenStatus::Ready { id } => {
                            black_box(id);
                        }
                        IdGenStatus::Pending { .. } => unreachable!(),
                    }
                }
                elapsed += start.elapsed();
            }
            elapsed
        });
    });

    group.finish();
}

/// One sequencer shared by several threads on the real clock.
fn benchmark_mono_contended(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("mono/contended");

    for thread_count in [1, 2, 4, 8] {
        let ids_per_thread = TOTAL_IDS / thread_count;
        group.throughput(Throughput::Elements((ids_per_thread * thread_count) as u64));
        group.bench_function(
            format!("elems/{TOTAL_IDS}/threads/{thread_count}"),
            |b| {
                let sequencer = attached(&rt, MonotonicClock::default());
                b.iter_custom(|iters| {
                    let start = Instant::now();
                    for _ in 0..iters {
                        let barrier = Arc::new(Barrier::new(thread_count));
                        scope(|s| {
                            for _ in 0..thread_count {
                                let barrier = Arc::clone(&barrier);
                                let sequencer = &sequencer;
                                s.spawn(move || {
                                    barrier.wait();
                                    for _ in 0..ids_per_thread {
                                        black_box(sequencer.next_id().unwrap());
                                    }
                                });
                            }
                        });
                    }
                    start.elapsed()
                });
            },
        );
    }

    group.finish();
}

/// Async generation on a single Tokio worker, waiting with `S` whenever a
/// millisecond's counter space runs out.
fn bench_mono_sequential_tokio<S: SleepProvider>(c: &mut Criterion, name: &str) {
    let rt = runtime();
    let sequencer = attached(&rt, MonotonicClock::default());
    let sequencer = &sequencer;
    let mut group = c.benchmark_group(format!("mono/sequential/async/tokio/{name}"));
    group.throughput(Throughput::Elements(TOTAL_IDS as u64));

    group.bench_function(format!("elems/{TOTAL_IDS}"), |b| {
        b.to_async(&rt).iter_custom(|iters| async move {
            let start = Instant::now();
            for _ in 0..iters {
                for _ in 0..TOTAL_IDS {
                    black_box(sequencer.next_id_with::<S>().await.unwrap());
                }
            }
            start.elapsed()
        });
    });

    group.finish();
}

fn benchmark_mono_sequential_tokio(c: &mut Criterion) {
    bench_mono_sequential_tokio::<TokioSleep>(c, "sleep");
    bench_mono_sequential_tokio::<TokioYield>(c, "yield");
}

/// Lease round trip through a partition actor with one synchronous backup.
fn benchmark_cluster_attach_detach(c: &mut Criterion) {
    let rt = runtime();
    let (cluster, sequencer) = rt.block_on(async {
        let cluster = LocalCluster::start(LocalClusterConfig::default()).unwrap();
        cluster
            .registry()
            .create_sequence(SequenceDefinition::builder("bench").build().unwrap())
            .unwrap();
        let member = cluster.members()[0].clone();
        let sequencer = cluster.sequencer(&member, "bench").unwrap();
        (cluster, sequencer)
    });
    let sequencer = &sequencer;

    let mut group = c.benchmark_group("cluster/lease");
    group.throughput(Throughput::Elements(1));
    group.bench_function("attach_detach", |b| {
        b.to_async(&rt).iter(|| async move {
            sequencer.attach().await.unwrap();
            sequencer.detach().await.unwrap();
        });
    });
    group.finish();

    drop(cluster);
}

criterion_group!(
    benches,
    benchmark_mock_sequential,
    benchmark_mono_contended,
    benchmark_mono_sequential_tokio,
    benchmark_cluster_attach_detach,
);
criterion_main!(benches);
