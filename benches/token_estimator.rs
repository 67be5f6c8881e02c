use conversation_engine::context::{ScriptAwareEstimator, TokenEstimator};
use conversation_engine::stream::{Interpreter, StreamEvent};
use conversation_engine::Transcript;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn bench_estimate(c: &mut Criterion) {
    let estimator = ScriptAwareEstimator::default();
    let mut group = c.benchmark_group("estimate");

    let samples = [
        ("latin", "The quick brown fox jumps over the lazy dog. ".repeat(200)),
        ("cjk", "我们今天讨论上下文压缩的策略。".repeat(200)),
        ("mixed", "Release 2.3 发布说明: 修复了 streaming cursor 的问题。".repeat(200)),
    ];

    for (name, text) in samples.iter() {
        group.bench_with_input(BenchmarkId::from_parameter(name), text, |b, text| {
            b.iter(|| estimator.estimate(black_box(text)))
        });
    }
    group.finish();
}

fn bench_delta_assembly(c: &mut Criterion) {
    c.bench_function("interpreter_1k_deltas", |b| {
        b.iter(|| {
            let mut interpreter = Interpreter::new();
            let mut transcript = Transcript::new();
            for i in 0..1000 {
                let fragment = if i % 2 == 0 { "tok " } else { "en " };
                interpreter.consume(StreamEvent::delta("m1", fragment), &mut transcript);
            }
            black_box(transcript.len())
        })
    });
}

criterion_group!(benches, bench_estimate, bench_delta_assembly);
criterion_main!(benches);
