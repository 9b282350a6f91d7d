//! Throughput of the core task lifecycle: spawn a batch of tasks that each
//! yield once via `suspend_for_duration(0)` (spec.md §8 Laws:
//! "`suspend_for_duration(ns=0)` is a yield") then exit, and drive them all
//! to completion with `Executor::run`.

use criterion::{criterion_group, criterion_main, Criterion};
use rex::{Config, Executor, Priority, SwitcherKind, TaskHandle};
use std::time::Duration;

fn spawn_and_run_batch(n: usize) {
    let config = Config::new()
        .switcher_kind(SwitcherKind::Setjmp)
        .ring_entries(256)
        .wr_ring_entries(0);
    let mut executor = Executor::new(0, &config).expect("executor");

    for _ in 0..n {
        executor
            .spawn(
                || {
                    TaskHandle.suspend_for_duration(0).ok();
                    0
                },
                Priority::Normal,
                Priority::Normal,
            )
            .expect("spawn");
    }

    let mut processed = 0;
    while processed < n {
        processed += executor
            .run(n, Some(Duration::ZERO))
            .expect("run");
    }
}

fn bench_spawn_and_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn_and_run");
    for &n in &[64usize, 512, 4096] {
        group.bench_function(format!("{n}_tasks"), |b| {
            b.iter(|| spawn_and_run_batch(n));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_spawn_and_run);
criterion_main!(benches);
