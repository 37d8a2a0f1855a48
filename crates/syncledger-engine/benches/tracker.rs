use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use syncledger_engine::clock::SystemClock;
use syncledger_engine::metrics::NoopMetricClient;
use syncledger_engine::StreamStatsTracker;
use syncledger_types::state::StateMessage;
use syncledger_types::stream::StreamKey;

fn tracker() -> StreamStatsTracker {
    StreamStatsTracker::new(Arc::new(NoopMetricClient), Arc::new(SystemClock))
}

fn bench_record_emitted(c: &mut Criterion) {
    let tracker = tracker();
    let streams: Vec<StreamKey> = (0..16).map(|i| StreamKey::new(format!("s{i}"))).collect();
    let mut i = 0usize;
    c.bench_function("record_emitted_message", |b| {
        b.iter(|| {
            i = (i + 1) % streams.len();
            tracker.record_emitted_message(black_box(&streams[i]), black_box(128));
        });
    });
}

fn bench_checkpoint_cycle(c: &mut Criterion) {
    let tracker = tracker();
    let stream = StreamKey::new("users");
    let mut cursor = 0u64;
    c.bench_function("checkpoint_ack_cycle", |b| {
        b.iter(|| {
            cursor += 1;
            let state = StateMessage::stream(stream.clone(), json!({ "cursor": cursor }));
            for _ in 0..100 {
                tracker.record_emitted_message(&stream, 64);
            }
            tracker.record_source_checkpoint(&state);
            tracker.record_destination_checkpoint(black_box(&state));
        });
    });
}

fn bench_total_stats(c: &mut Criterion) {
    let tracker = tracker();
    for i in 0..64 {
        let stream = StreamKey::new(format!("s{i}"));
        for _ in 0..10 {
            tracker.record_emitted_message(&stream, 256);
        }
    }
    c.bench_function("get_total_stats_64_streams", |b| {
        b.iter(|| black_box(tracker.get_total_stats(false)));
    });
}

criterion_group!(
    benches,
    bench_record_emitted,
    bench_checkpoint_cycle,
    bench_total_stats
);
criterion_main!(benches);
