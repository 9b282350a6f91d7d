//! Throughput of claim-then-release on the registered small-buffer pool
//! (spec.md §8 Laws: "Claim-then-release of a registered buffer is the
//! identity on the pool's free set") when there is no contention — the
//! fast path that never appends to the FIFO waiter list.

use criterion::{criterion_group, criterion_main, Criterion};
use rex::{Config, Executor, Priority, RingSelector, SwitcherKind, TaskHandle};
use std::time::Duration;

fn claim_release_batch(n: usize) {
    let config = Config::new()
        .switcher_kind(SwitcherKind::Setjmp)
        .ring_entries(256)
        .wr_ring_entries(0);
    let mut executor = Executor::new(0, &config).expect("executor");

    executor
        .spawn(
            move || {
                for _ in 0..n {
                    let buf = TaskHandle
                        .claim_registered_buffer(RingSelector::NonWrite, 4096, false)
                        .expect("claim");
                    TaskHandle.release_registered_buffer(RingSelector::NonWrite, buf);
                }
                0
            },
            Priority::Normal,
            Priority::Normal,
        )
        .expect("spawn");

    let mut processed = 0;
    while processed == 0 {
        processed += executor.run(1, Some(Duration::ZERO)).expect("run");
    }
}

fn bench_buffer_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_pool_claim_release");
    for &n in &[64usize, 1024, 8192] {
        group.bench_function(format!("{n}_ops"), |b| {
            b.iter(|| claim_release_batch(n));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_buffer_pool);
criterion_main!(benches);
