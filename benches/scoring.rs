//! Benchmarks for detectors and the scoring engine.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use confluence::prelude::*;

/// Generate realistic random bars
fn generate_bars(n: usize) -> Vec<Bar> {
  let mut bars = Vec::with_capacity(n);
  let mut price = 100.0;

  for i in 0..n {
    let change = ((i * 7 + 13) % 100) as f64 / 50.0 - 1.0; // Deterministic "random"
    let volatility = 2.0 + ((i * 3) % 10) as f64 / 5.0;

    let o = price;
    let c = (price + change).max(10.0);
    let h = o.max(c) + volatility * 0.5;
    let l = o.min(c) - volatility * 0.5;

    bars.push(Bar::new(o, h, l, c, 1000.0).with_timestamp(i as i64));
    price = c;
  }

  bars
}

fn bench_pivots(c: &mut Criterion) {
  let bars = generate_bars(1000);
  let extractor = SwingExtractor::with_threshold(3.0);

  c.bench_function("extract_pivots_1000_bars", |b| {
    b.iter(|| {
      let _ = black_box(extractor.extract(black_box(&bars)));
    })
  });
}

fn bench_detectors(c: &mut Criterion) {
  let bars = generate_bars(1000);
  let ctx = ScoringContext::default();
  let mut group = c.benchmark_group("detectors");

  for detector in BuiltinDetector::all_defaults() {
    group.bench_function(detector.name().to_string(), |b| {
      b.iter(|| {
        let _ = black_box(detector.evaluate(black_box(&bars), &ctx));
      })
    });
  }

  group.finish();
}

fn bench_score_blocking(c: &mut Criterion) {
  let engine = EngineBuilder::new().with_all_defaults().build().unwrap();
  let ctx = ScoringContext::default();
  let mut group = c.benchmark_group("scaling");

  for size in [200, 500, 1000, 5000].iter() {
    let bars = generate_bars(*size);

    group.bench_with_input(BenchmarkId::new("score_blocking", size), size, |b, _| {
      b.iter(|| {
        let _ = black_box(engine.score_blocking(black_box(&bars), &ctx));
      })
    });
  }

  group.finish();
}

fn bench_score_async(c: &mut Criterion) {
  let bars = generate_bars(1000);
  let engine = EngineBuilder::new().with_all_defaults().build().unwrap();
  let ctx = ScoringContext::default();
  let runtime = tokio::runtime::Runtime::new().unwrap();

  c.bench_function("score_async_1000_bars", |b| {
    b.iter(|| {
      let _ = black_box(runtime.block_on(engine.score(black_box(&bars), &ctx)));
    })
  });
}

fn bench_parallel_scan(c: &mut Criterion) {
  let bars1 = generate_bars(1000);
  let bars2 = generate_bars(1000);
  let bars3 = generate_bars(1000);
  let bars4 = generate_bars(1000);

  let engine = EngineBuilder::new().with_all_defaults().build().unwrap();
  let ctx = ScoringContext::default();
  let rule = ScanRule::default();

  let instruments: Vec<(&str, &[Bar])> =
    vec![("SYM1", &bars1), ("SYM2", &bars2), ("SYM3", &bars3), ("SYM4", &bars4)];

  c.bench_function("parallel_scan_4_instruments", |b| {
    b.iter(|| {
      let _ = black_box(scan_parallel(
        black_box(&engine),
        black_box(instruments.clone()),
        &ctx,
        &rule,
      ));
    })
  });
}

criterion_group!(
  benches,
  bench_pivots,
  bench_detectors,
  bench_score_blocking,
  bench_score_async,
  bench_parallel_scan,
);

criterion_main!(benches);
