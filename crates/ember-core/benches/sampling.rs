//! Benchmarks for next-token sampling.
//!
//! Sampling sorts the whole vocabulary on every call, so cost is dominated
//! by vocabulary size and the truncation settings.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ember_core::sampling::{RepeatPenalty, Sampler, SamplingParams};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn logits(n_vocab: usize) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(0);
    (0..n_vocab).map(|_| rng.gen_range(-10.0..10.0)).collect()
}

fn bench_vocab_sizes(c: &mut Criterion) {
    let sampler = Sampler::new(SamplingParams::default()).expect("valid params");
    let mut group = c.benchmark_group("sample_default");

    for n_vocab in [1024, 32768, 65536] {
        let logits = logits(n_vocab);
        let mut rng = StdRng::seed_from_u64(1);
        group.bench_with_input(BenchmarkId::from_parameter(n_vocab), &logits, |b, logits| {
            b.iter(|| black_box(sampler.sample(black_box(logits), None, &mut rng)))
        });
    }
    group.finish();
}

fn bench_settings(c: &mut Criterion) {
    let logits = logits(32768);
    let recent: Vec<u32> = (0..64).map(|i| i * 97).collect();
    let mut group = c.benchmark_group("sample_32k");

    let configs = [
        ("greedy", SamplingParams { top_k: 1, top_p: 1.0, temperature: 1.0 }),
        ("top_k_40", SamplingParams { top_k: 40, top_p: 1.0, temperature: 0.8 }),
        ("full_top_p", SamplingParams { top_k: 0, top_p: 0.95, temperature: 0.8 }),
    ];
    for (name, params) in configs {
        let sampler = Sampler::new(params).expect("valid params");
        let mut rng = StdRng::seed_from_u64(2);
        group.bench_function(name, |b| {
            b.iter(|| black_box(sampler.sample(black_box(&logits), None, &mut rng)))
        });
    }

    let sampler = Sampler::new(SamplingParams::default()).expect("valid params");
    let penalty = RepeatPenalty::new(&recent, 64, 1.1);
    let mut rng = StdRng::seed_from_u64(3);
    group.bench_function("repeat_penalty", |b| {
        b.iter(|| black_box(sampler.sample(black_box(&logits), Some(&penalty), &mut rng)))
    });
    group.finish();
}

criterion_group!(benches, bench_vocab_sizes, bench_settings);
criterion_main!(benches);
