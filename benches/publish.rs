//! Performance benchmarks for eventbridge
//!
//! Run with: cargo bench

use criterion::{criterion_group, criterion_main, Criterion};
use eventbridge::{
    compile_rule, BusAdapter, InboundEvent, MemoryAdapter, StoredEvent,
};

fn sample_event() -> InboundEvent {
    InboundEvent::new(
        "agent-1",
        "task.complete",
        serde_json::json!({"duration": 650, "status": "ok", "worker": "agent-1"}),
    )
    .with_correlation("bench-corr")
}

fn bench_event_creation(c: &mut Criterion) {
    c.bench_function("InboundEvent validate", |b| {
        let event = sample_event();
        b.iter(|| event.validate(65536).unwrap());
    });

    c.bench_function("StoredEvent seal", |b| {
        b.iter(|| StoredEvent::seal(sample_event(), 1_700_000_000_000, 1));
    });
}

fn bench_event_serialization(c: &mut Criterion) {
    let stored = StoredEvent::seal(sample_event(), 1_700_000_000_000, 42);

    c.bench_function("StoredEvent serialize", |b| {
        b.iter(|| serde_json::to_vec(&stored).unwrap());
    });

    let bytes = serde_json::to_vec(&stored).unwrap();
    c.bench_function("StoredEvent deserialize", |b| {
        b.iter(|| serde_json::from_slice::<StoredEvent>(&bytes).unwrap());
    });
}

fn bench_rule_engine(c: &mut Criterion) {
    let source = "type == \"task.complete\" and (payload.duration > 500 or payload.status contains \"ok\")";

    c.bench_function("rule compile", |b| {
        b.iter(|| compile_rule(source).unwrap());
    });

    let rule = compile_rule(source).unwrap();
    let event = StoredEvent::seal(sample_event(), 1_700_000_000_000, 42);
    c.bench_function("rule evaluate", |b| {
        b.iter(|| rule.matches(&event));
    });
}

fn bench_memory_publish(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("MemoryAdapter publish", |b| {
        b.to_async(&rt).iter(|| async {
            let adapter = MemoryAdapter::default();
            adapter.publish(sample_event()).await.unwrap()
        });
    });
}

fn bench_memory_publish_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("publish_throughput");
    for count in [10, 100, 1000] {
        group.bench_function(format!("{} events", count), |b| {
            b.to_async(&rt).iter(|| async {
                let adapter = MemoryAdapter::default();
                for i in 0..count {
                    adapter
                        .publish(InboundEvent::new(
                            "bench",
                            "task.complete",
                            serde_json::json!({ "i": i }),
                        ).with_correlation("c"))
                        .await
                        .unwrap();
                }
            });
        });
    }
    group.finish();
}

fn bench_memory_list_recent(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    // Pre-populate
    let adapter = rt.block_on(async {
        let adapter = MemoryAdapter::default();
        for i in 0..1000 {
            adapter
                .publish(
                    InboundEvent::new("bench", "task.complete", serde_json::json!({ "i": i }))
                        .with_correlation("c"),
                )
                .await
                .unwrap();
        }
        adapter
    });

    c.bench_function("list_recent (limit 100)", |b| {
        b.to_async(&rt)
            .iter(|| async { adapter.list_recent(100).await.unwrap() });
    });
}

criterion_group!(
    benches,
    bench_event_creation,
    bench_event_serialization,
    bench_rule_engine,
    bench_memory_publish,
    bench_memory_publish_throughput,
    bench_memory_list_recent,
);
criterion_main!(benches);
