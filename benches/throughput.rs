use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::error::Error;
use std::fmt;
use std::time::Duration;
use switchgear::{Action, BucketRangeFinder, Config, Switchgear};

// Custom error type that implements Error trait
#[derive(Debug)]
struct BenchError(String);

impl BenchError {
    fn new(msg: &str) -> Self {
        BenchError(msg.to_string())
    }
}

impl fmt::Display for BenchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Benchmark error: {}", self.0)
    }
}

impl Error for BenchError {}

fn switchgear() -> Switchgear {
    Switchgear::new(
        Config::builder()
            .max_consecutive_failures(5)
            .circuit_open_time(Duration::from_secs(30))
            .build()
            .unwrap(),
    )
}

fn bench_closed_execute(c: &mut Criterion) {
    let switchgear = switchgear();
    let action = Action::builder(|| Ok::<_, BenchError>(42)).group("closed").build();

    c.bench_function("switchgear_closed_success", |b| {
        b.iter(|| black_box(switchgear.execute(&action)));
    });
}

fn bench_open_short_circuit(c: &mut Criterion) {
    let switchgear = switchgear();
    let failing = Action::builder(|| Err::<u32, _>(BenchError::new("Simulated failure")))
        .group("open")
        .build();
    let succeeding = Action::builder(|| Ok::<_, BenchError>(42))
        .group("open")
        .open_fallback(|_| 0)
        .build();

    // Trip the breaker once; it stays open for the whole run
    for _ in 0..5 {
        let _ = switchgear.execute(&failing);
    }

    c.bench_function("switchgear_open_short_circuit", |b| {
        b.iter(|| black_box(switchgear.execute(&succeeding)));
    });
}

fn bench_parallel_execute(c: &mut Criterion) {
    let switchgear = switchgear();
    let actions: Vec<Action<usize>> = (0..16)
        .map(|i| Action::builder(move || Ok::<_, BenchError>(i)).group("parallel").build())
        .collect();

    c.bench_function("switchgear_parallel_16", |b| {
        b.iter(|| black_box(switchgear.execute_in_parallel(&actions)));
    });
}

fn bench_bucket_finder(c: &mut Criterion) {
    let finder = BucketRangeFinder::fixed(50).unwrap();

    c.bench_function("bucket_finder_fixed", |b| {
        b.iter(|| black_box(finder.find(black_box(Duration::from_millis(1234)))));
    });
}

criterion_group!(
    benches,
    bench_closed_execute,
    bench_open_short_circuit,
    bench_parallel_execute,
    bench_bucket_finder
);
criterion_main!(benches);
