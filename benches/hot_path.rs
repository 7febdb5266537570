//! Hot path benchmarks
//!
//! Measures the per-notification cost paid by instrumented code:
//!
//! 1. Probe with nothing installed (one atomic load)
//! 2. Probe on a pruned site (epoch check, no observer call)
//! 3. Matched site, cached decision, frequency-gated skip
//! 4. Glob matching on first sight
//! 5. `spin_delay_ns` accuracy at short delays
//!
//! # Run Instructions
//!
//! ```bash
//! cargo bench --bench hot_path
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use speed_bump::engine::InterceptionEngine;
use speed_bump::host::{CallSite, CallSiteId, ProbeHost};
use speed_bump::pattern::{glob_match, TargetPattern};
use speed_bump::{probe, spin_delay_ns, Config};

fn bench_probe_uninstalled(c: &mut Criterion) {
    let host = ProbeHost::new("bench-idle");
    c.bench_function("probe_uninstalled", |b| {
        b.iter(|| probe!(host, "idle_site"));
    });
}

fn bench_probe_pruned(c: &mut Criterion) {
    let engine = InterceptionEngine::new(ProbeHost::new("bench-pruned"));
    engine.install(Config::new(vec![TargetPattern::new("nothing", "matches")]));

    c.bench_function("probe_pruned", |b| {
        b.iter(|| probe!(engine.host(), "pruned_site"));
    });
}

/// Cached match with a frequency gate high enough that no delay runs
fn bench_decision_cached(c: &mut Criterion) {
    let engine = InterceptionEngine::new(ProbeHost::new("bench-cached"));
    engine.install(
        Config::new(vec![TargetPattern::new("hot_path", "cached_*")])
            .with_delay_ns(0)
            .with_frequency(u32::MAX),
    );
    let site = CallSite::new(CallSiteId::from_raw(1), "hot_path", "cached_site");

    c.bench_function("decision_cached", |b| {
        b.iter(|| engine.host().fire_site(black_box(&site)));
    });
}

fn bench_glob_match(c: &mut Criterion) {
    let mut group = c.benchmark_group("glob_match");
    let cases = [
        ("literal", "vllm.worker.model_runner", "vllm.worker.model_runner"),
        ("prefix_star", "transformers.*", "transformers.modeling_llama"),
        ("backtrack", "*Attention*forward", "LlamaAttention.inner.forward"),
    ];
    for (label, pattern, text) in cases {
        group.bench_with_input(BenchmarkId::from_parameter(label), &(pattern, text), |b, (p, t)| {
            b.iter(|| glob_match(black_box(p), black_box(t)));
        });
    }
    group.finish();
}

fn bench_spin_delay(c: &mut Criterion) {
    let mut group = c.benchmark_group("spin_delay_ns");
    for delay in [0u64, 100, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(delay), &delay, |b, &delay| {
            b.iter(|| spin_delay_ns(black_box(delay)));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_probe_uninstalled,
    bench_probe_pruned,
    bench_decision_cached,
    bench_glob_match,
    bench_spin_delay
);
criterion_main!(benches);
