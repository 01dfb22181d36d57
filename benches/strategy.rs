use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use minishard::job::strategy::{strategy_for, AVG_ALLOCATION, HRW, ODEVITY, ROUND_ROBIN};

fn instances(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("10.0.{}.{}@-@{}", i / 250, i % 250, 1000 + i)).collect()
}

fn bench_strategies(c: &mut Criterion) {
    let mut group = c.benchmark_group("sharding");
    for &(fleet, items) in &[(3usize, 10u32), (50, 1_000), (200, 10_000)] {
        let fleet_ids = instances(fleet);
        for name in [AVG_ALLOCATION, ODEVITY, ROUND_ROBIN, HRW] {
            let Ok(strategy) = strategy_for(Some(name)) else {
                continue;
            };
            group.bench_with_input(
                BenchmarkId::new(name, format!("{}x{}", fleet, items)),
                &fleet_ids,
                |b, ids| b.iter(|| strategy.sharding(black_box(ids), items, "bench_job")),
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_strategies);
criterion_main!(benches);
