use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use std::{sync::Arc, time::Instant};
use tokio::runtime::Builder;
use xidgate::{
    BoundedMailbox, IdentitySequencer, LocalLedger, PreAllocationPool, SequencerConfig,
    TransactionId, sort_circular,
};

// Number of items moved per benchmark iteration.
const TOTAL: usize = 4096;

/// Single producer, single draining owner, no contention.
fn bench_mailbox_push_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("mailbox");
    group.throughput(Throughput::Elements(TOTAL as u64));

    group.bench_function(format!("try_push_drain/{TOTAL}"), |b| {
        let mailbox = BoundedMailbox::new(TOTAL);
        b.iter(|| {
            for i in 0..TOTAL {
                let _ = mailbox.try_push(i);
            }
            black_box(mailbox.drain_all());
        });
    });

    group.finish();
}

/// Four producers pushing through a mailbox much smaller than the load, so
/// most pushes wait for a drain.
fn bench_mailbox_contended(c: &mut Criterion) {
    let rt = Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();
    let mut group = c.benchmark_group("mailbox");
    group.throughput(Throughput::Elements(TOTAL as u64));

    group.bench_function(format!("contended_push/{TOTAL}"), |b| {
        b.to_async(&rt).iter_custom(|iters| async move {
            let start = Instant::now();
            for _ in 0..iters {
                let mailbox = Arc::new(BoundedMailbox::new(64));
                let producers: Vec<_> = (0..4)
                    .map(|_| {
                        let mailbox = Arc::clone(&mailbox);
                        tokio::spawn(async move {
                            for i in 0..TOTAL / 4 {
                                mailbox.push(i).await.unwrap();
                            }
                        })
                    })
                    .collect();
                let mut received = 0;
                while received < TOTAL {
                    received += mailbox.recv_all().await.unwrap().len();
                }
                for producer in producers {
                    producer.await.unwrap();
                }
            }
            start.elapsed()
        });
    });

    group.finish();
}

fn bench_pool_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool");
    group.throughput(Throughput::Elements(TOTAL as u64));

    // Batches straddle the wraparound point to exercise circular sorting.
    let batch: Vec<_> = (0..TOTAL as u32)
        .map(|i| TransactionId::from_raw(u32::MAX - 2048).advance(i))
        .rev()
        .collect();

    group.bench_function(format!("merge_pop/{TOTAL}"), |b| {
        b.iter(|| {
            let mut pool = PreAllocationPool::new(TOTAL);
            pool.merge(batch.iter().copied());
            while let Some(id) = pool.pop() {
                black_box(id);
            }
        });
    });

    group.bench_function(format!("sort_circular/{TOTAL}"), |b| {
        b.iter(|| {
            let mut ids = batch.clone();
            sort_circular(&mut ids);
            black_box(ids);
        });
    });

    group.finish();
}

fn bench_sequencer_allocate(c: &mut Criterion) {
    let rt = Builder::new_multi_thread().enable_all().build().unwrap();
    let mut group = c.benchmark_group("sequencer");
    group.throughput(Throughput::Elements(TOTAL as u64));

    for pool_target in [0, 64, 1024] {
        group.bench_function(format!("allocate_finish/pool_{pool_target}/{TOTAL}"), |b| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let sequencer = IdentitySequencer::spawn(
                    LocalLedger::default(),
                    SequencerConfig::default().with_pool_target(pool_target),
                );
                let start = Instant::now();
                for _ in 0..iters {
                    for _ in 0..TOTAL {
                        let deadline = tokio::time::Instant::now() + sequencer.request_timeout();
                        let id = sequencer.allocate(deadline).await.unwrap();
                        black_box(sequencer.finish(id, true, deadline).await.unwrap());
                    }
                }
                let elapsed = start.elapsed();
                sequencer.shutdown().await;
                elapsed
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_mailbox_push_drain,
    bench_mailbox_contended,
    bench_pool_merge,
    bench_sequencer_allocate
);
criterion_main!(benches);
