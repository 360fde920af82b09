//! End-to-end chat load test for confab.
//!
//! This benchmark measures delivered chat message throughput over real
//! WebSocket connections.

use bytes::BytesMut;
use confab_bench::dev_token;
use confab_protocol::{codec, Frame};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const SERVER_URL: &str = "ws://127.0.0.1:4000/socket";
const TOPIC: &str = "conversation:1";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║            Confab End-to-End Chat Load Test                  ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Start the server first:                                     ║");
    println!("║    CONFAB_DEMO_USERS=128 cargo run --release --bin confab    ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_chat_benchmark(num_clients).await;
}

async fn run_chat_benchmark(num_clients: usize) {
    println!("📊 Chat Benchmark: {} clients on {}", num_clients, TOPIC);
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let message_count = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();

    // Spawn client tasks
    for client_id in 0..num_clients {
        let msg_count = Arc::clone(&message_count);
        let barrier = Arc::clone(&barrier);

        let handle = tokio::spawn(async move {
            if let Err(e) = run_client(client_id, msg_count, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        });
        handles.push(handle);
    }

    // Wait for all clients to join
    barrier.wait().await;
    println!("✓ All {} clients joined", num_clients);

    // Warmup phase
    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    // Reset counter and start measurement
    message_count.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total_delivered = message_count.load(Ordering::SeqCst);

    // Calculate throughput
    let msgs_per_sec = total_delivered as f64 / elapsed.as_secs_f64();
    let msgs_per_sec_per_client = msgs_per_sec / num_clients as f64;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Clients:              {:>10}                           ║",
        num_clients
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!(
        "║  Delivered Messages:   {:>10}                           ║",
        total_delivered
    );
    println!(
        "║  Throughput:           {:>10.0} msg/s                    ║",
        msgs_per_sec
    );
    println!(
        "║  Per-Client:           {:>10.0} msg/s                    ║",
        msgs_per_sec_per_client
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    // Signal clients to stop
    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    client_id: usize,
    message_count: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Each client connects as its own demo user
    let user_id = client_id as u64 + 1;
    let url = format!("{}?token={}&vsn=1.0", SERVER_URL, dev_token(user_id));
    let (ws, _) = connect_async(&url).await?;
    let (mut sender, mut receiver) = ws.split();

    // Join the shared conversation
    let join_frame = Frame::join(TOPIC, json!({}), 1);
    let join_bytes = codec::encode(&join_frame)?;
    sender.send(Message::Binary(join_bytes.to_vec())).await?;

    // Wait for the join reply
    let mut recv_buf = BytesMut::with_capacity(65536);
    'joined: while let Some(result) = receiver.next().await {
        if let Ok(Message::Binary(data)) = result {
            recv_buf.extend_from_slice(&data);
            while let Some(frame) = codec::decode_from(&mut recv_buf)? {
                if matches!(frame, Frame::Reply { .. }) {
                    break 'joined;
                }
            }
        }
    }

    // Wait for all clients to be ready
    barrier.wait().await;

    // Pre-encode the create frame for efficiency
    let create_frame = Frame::event(
        TOPIC,
        "create",
        json!({ "content": "benchmark message", "type": "text" }),
        2,
    );
    let create_bytes = codec::encode(&create_frame)?;
    let create_msg = Message::Binary(create_bytes.to_vec());

    // Spawn separate receiver task for full-duplex operation
    let recv_count = message_count.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            if let Ok(Message::Binary(data)) = result {
                recv_buf.extend_from_slice(&data);
                // Count delivered chat messages, skip replies
                while let Ok(Some(frame)) = codec::decode_from(&mut recv_buf) {
                    if matches!(&frame, Frame::Push { event, .. } if event == "new_msg") {
                        recv_count.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    });

    // Send loop - no waiting, just blast messages
    loop {
        if sender.send(create_msg.clone()).await.is_err() {
            break;
        }
        // Small yield to not starve the receiver task
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
