//! Benchmarks for unigram segmentation.
//!
//! Encoding is quadratic in the input length bounded by the longest piece,
//! so these track how prompt length and vocabulary shape affect latency.
//!
//! # Benchmark Scenarios
//!
//! 1. Prompt length sweep over a letter + bigram vocabulary
//! 2. Decode of the resulting ids

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ember_core::model::{Tokenizer, WORD_BOUNDARY};

/// Letters, bigrams and a few whole words with decreasing probability.
fn build_vocab() -> Tokenizer {
    let letters: Vec<char> = ('a'..='z').collect();
    let mut pieces: Vec<(String, f32)> = vec![("<|endoftext|>".into(), 0.0)];
    pieces.push((WORD_BOUNDARY.into(), 2.0));
    for &c in &letters {
        pieces.push((c.to_string(), 5.0));
        pieces.push((format!("{WORD_BOUNDARY}{c}"), 4.5));
    }
    for &a in &letters {
        for &b in &letters {
            pieces.push((format!("{a}{b}"), 7.0));
        }
    }
    for word in ["the", "def", "return", "self", "import", "class", "for", "in"] {
        pieces.push((format!("{WORD_BOUNDARY}{word}"), 3.0));
    }
    Tokenizer::from_pieces(pieces).expect("unique pieces")
}

fn prompt(words: usize) -> String {
    let sample = ["def", "fibonacci", "n", "return", "self", "for", "index", "in", "range"];
    (0..words)
        .map(|i| sample[i % sample.len()])
        .collect::<Vec<_>>()
        .join(" ")
}

fn bench_encode(c: &mut Criterion) {
    let tokenizer = build_vocab();
    let mut group = c.benchmark_group("encode");

    for words in [8, 64, 256] {
        let text = prompt(words);
        group.throughput(Throughput::Bytes(text.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(words), &text, |b, text| {
            b.iter(|| black_box(tokenizer.encode(black_box(text))))
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let tokenizer = build_vocab();
    let ids = tokenizer.encode(&prompt(256));

    c.bench_function("decode_256_words", |b| {
        b.iter(|| black_box(tokenizer.decode(black_box(&ids))))
    });
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
