use criterion::{black_box, criterion_group, criterion_main, Criterion};
use staged_pipeline::{Many2One, One2Many, One2One, Pipeline, Source};
use std::time::Duration;

fn benchmark_single_stage_throughput(c: &mut Criterion) {
    c.bench_function("single_stage_1000_items", |b| {
        b.iter(|| {
            let results = Pipeline::new(Source::new(0..1000u64).buffer_size(100))
                .then(One2One::new(|x: u64| black_box(x)).buffer_size(100))
                .collect()
                .expect("Pipeline failed");
            assert_eq!(results.len(), 1000);
        });
    });
}

fn benchmark_three_stage_throughput(c: &mut Criterion) {
    c.bench_function("three_stage_1000_items", |b| {
        b.iter(|| {
            let results = Pipeline::new(Source::new(0..1000u64))
                .then(One2One::new(|x: u64| vec![x as u8; 64]))
                .then(One2One::new(|data: Vec<u8>| data.len()))
                .then(One2One::new(|len: usize| black_box(len * 2)))
                .collect()
                .expect("Pipeline failed");
            assert_eq!(results.len(), 1000);
        });
    });
}

fn benchmark_parallel_workers(c: &mut Criterion) {
    let mut group = c.benchmark_group("parallel_cpu_stage_2000_items");
    for workers in [1, 2, 4, 8] {
        group.bench_function(format!("{workers}_workers"), |b| {
            b.iter(|| {
                let results = Pipeline::new(Source::new(0..2000u64))
                    .then(
                        One2One::new(|x: u64| {
                            (0..200).fold(x, |acc, i| acc.wrapping_mul(31).wrapping_add(i))
                        })
                        .workers(workers)
                        .buffer_size(64),
                    )
                    .collect()
                    .expect("Pipeline failed");
                black_box(results);
            });
        });
    }
    group.finish();
}

fn benchmark_fan_out_fan_in(c: &mut Criterion) {
    c.bench_function("fan_out_fan_in_500_items", |b| {
        b.iter(|| {
            let batches = Pipeline::new(Source::new(0..500u32))
                .then(One2Many::new(|x: u32| [x; 4]).buffer_size(50))
                .then(Many2One::new(8))
                .collect()
                .expect("Pipeline failed");
            assert_eq!(batches.len(), 250);
        });
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(10));
    targets = benchmark_single_stage_throughput, benchmark_three_stage_throughput,
        benchmark_parallel_workers, benchmark_fan_out_fan_in
);
criterion_main!(benches);
