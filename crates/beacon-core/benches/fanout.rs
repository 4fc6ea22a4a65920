//! Fan-out and security gate benchmarks for beacon-core.

use beacon_core::security::{allows, sanitize_data, Operation, RateLimiter};
use beacon_core::{ChannelRegistry, NoopSubscriber, RateLimitConfig};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;

fn bench_publish(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let mut group = c.benchmark_group("publish");

    for subscribers in [1usize, 100, 1000] {
        let registry = ChannelRegistry::new();
        let _handles: Vec<_> = (0..subscribers)
            .map(|_| registry.subscribe("room:bench", NoopSubscriber))
            .collect();
        let payload = json!({ "body": "x".repeat(64) });

        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            &subscribers,
            |b, _| {
                b.iter(|| {
                    rt.block_on(registry.publish("room:bench", black_box(payload.clone())))
                })
            },
        );
    }

    group.finish();
}

fn bench_subscribe(c: &mut Criterion) {
    c.bench_function("subscribe_unsubscribe", |b| {
        let registry = ChannelRegistry::new();
        let mut i = 0u64;
        b.iter(|| {
            let handle = registry.subscribe(&format!("room:{i}"), NoopSubscriber);
            i += 1;
            handle.unsubscribe()
        });
    });
}

fn bench_gate(c: &mut Criterion) {
    let mut group = c.benchmark_group("gate");

    let permissions: Vec<String> = ["read:public", "write:room", "presence"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    group.bench_function("allows", |b| {
        b.iter(|| allows(black_box(&permissions), black_box("room:42"), Some(Operation::Write)))
    });

    let limiter = RateLimiter::new(
        Some(RateLimitConfig {
            max_messages_per_minute: u32::MAX,
            ..RateLimitConfig::default()
        }),
        None,
    );
    group.bench_function("rate_limit", |b| {
        b.iter(|| limiter.check(black_box("client-1"), "publish"))
    });

    let payload = json!({
        "onClick": "x",
        "body": "hello <script>alert(1)</script> world",
        "nested": [{ "onLoad": "y", "text": "plain" }],
    });
    group.bench_function("sanitize", |b| b.iter(|| sanitize_data(black_box(payload.clone()))));

    group.finish();
}

criterion_group!(benches, bench_publish, bench_subscribe, bench_gate);
criterion_main!(benches);
