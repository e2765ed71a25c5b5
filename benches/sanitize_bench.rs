//! Benchmarks for output sanitizing and parsing

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use riddler_core::parser::{sanitize, OutputParser, ReplyKind};

fn noisy_reply(repeats: usize) -> String {
    let chunk = "RIDDLE:\t\tWhat has  keys \u{0007}but no locks?  \r\n\r\n\r\n\r\nANSWER:   A piano \t\n<|im_end|>\n";
    chunk.repeat(repeats)
}

fn bench_sanitize(c: &mut Criterion) {
    let mut group = c.benchmark_group("sanitize");

    for repeats in [1, 16, 256].iter() {
        let text = noisy_reply(*repeats);
        group.bench_with_input(BenchmarkId::from_parameter(text.len()), &text, |b, text| {
            b.iter(|| sanitize(black_box(text)));
        });
    }

    group.finish();
}

fn bench_parse_riddle(c: &mut Criterion) {
    let parser = OutputParser::new(
        ReplyKind::Riddle,
        vec!["<END_RIDDLE>".to_string(), "<|im_end|>".to_string()],
    );
    let text = noisy_reply(1);

    c.bench_function("parse_riddle", |b| {
        b.iter(|| parser.parse(black_box(&text)));
    });
}

criterion_group!(benches, bench_sanitize, bench_parse_riddle);
criterion_main!(benches);
