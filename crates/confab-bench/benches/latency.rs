//! Latency benchmarks for confab.
//!
//! These benchmarks focus on per-dispatch latency through the router and
//! membership lookup under load.

use confab_bench::local_socket;
use confab_core::{
    ChannelRegistry, MemoryStore, MessageRouter, PresenceConfig, PresenceTracker, Socket,
    StorePolicy, Topic,
};
use confab_protocol::{codec, Frame};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

/// Benchmark round-trip encode/decode latency.
fn bench_codec_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_roundtrip");

    let frame = Frame::event(
        "conversation:1",
        "create",
        json!({ "content": "x".repeat(256), "type": "text" }),
        1,
    );

    group.bench_function("256B", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&frame)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        });
    });

    group.finish();
}

/// Benchmark a full create dispatch: validate, persist, fan out.
fn bench_dispatch(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("dispatch");

    group.bench_function("create_two_members", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let store = Arc::new(MemoryStore::new());
                let conversation = store.create_conversation("bench", [1, 2]);
                let registry = Arc::new(ChannelRegistry::with_defaults());
                let presence = Arc::new(PresenceTracker::new(
                    Arc::clone(&registry),
                    PresenceConfig::default(),
                ));
                let policy = Arc::new(StorePolicy::new(store.clone()));
                let router = MessageRouter::new(Arc::clone(&registry), store, presence, policy);
                let topic = format!("conversation:{conversation}");

                let (alice, mut alice_rx) = local_socket(1);
                let (bob, mut bob_rx) = local_socket(2);
                router.handle_join(&alice, &topic, 1).await;
                router.handle_join(&bob, &topic, 2).await;
                while alice_rx.try_recv().is_ok() {}
                while bob_rx.try_recv().is_ok() {}

                let payload = json!({ "content": "hello", "type": "text" });
                let start = Instant::now();
                for i in 0..iters {
                    router
                        .handle_event(&alice, &topic, "create", &payload, i)
                        .await;
                    while bob_rx.try_recv().is_ok() {}
                }
                start.elapsed()
            })
        });
    });

    group.finish();
}

/// Benchmark frame type creation.
fn bench_frame_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_creation");

    group.bench_function("join", |b| {
        b.iter(|| Frame::join(black_box("conversation:1"), json!({}), black_box(1)))
    });

    group.bench_function("event", |b| {
        b.iter(|| {
            Frame::event(
                black_box("conversation:1"),
                black_box("create"),
                json!({ "content": "hello", "type": "text" }),
                black_box(1),
            )
        })
    });

    group.bench_function("reply_ok", |b| {
        b.iter(|| Frame::reply_ok(black_box("conversation:1"), json!({}), black_box(1)))
    });

    group.bench_function("push", |b| {
        b.iter(|| {
            Frame::push(
                black_box("conversation:1"),
                black_box("new_msg"),
                json!({ "user_id": 7 }),
            )
        })
    });

    group.finish();
}

/// Benchmark membership lookup with many live conversations.
fn bench_membership_lookup(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("membership_lookup");

    // Setup: 1000 conversations with 10 members each
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(ChannelRegistry::with_defaults());
    let policy = StorePolicy::new(store.clone());
    let mut sockets: Vec<Socket> = Vec::new();
    let mut receivers = Vec::new();
    let topics: Vec<Topic> = rt.block_on(async {
        let mut topics = Vec::with_capacity(1000);
        for i in 0..1000u64 {
            let users = (i * 10 + 1)..=(i * 10 + 10);
            let conversation = store.create_conversation(format!("room-{i}"), users.clone());
            let topic = Topic::conversation(conversation);
            for user in users {
                let (socket, rx) = local_socket(user);
                registry
                    .join(&topic, &socket, &policy)
                    .await
                    .expect("bench join");
                sockets.push(socket);
                receivers.push(rx);
            }
            topics.push(topic);
        }
        topics
    });

    group.bench_function("member_count", |b| {
        let mut i = 0usize;
        b.iter(|| {
            let topic = &topics[i % topics.len()];
            i += 1;
            registry.member_count(black_box(topic))
        });
    });

    group.bench_function("is_joined", |b| {
        let mut i = 0usize;
        b.iter(|| {
            let index = i % topics.len();
            i += 1;
            let topic = &topics[index];
            let socket = &sockets[index * 10];
            registry.is_joined(black_box(topic), socket.connection_id())
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_codec_roundtrip,
    bench_dispatch,
    bench_frame_creation,
    bench_membership_lookup,
);
criterion_main!(benches);
