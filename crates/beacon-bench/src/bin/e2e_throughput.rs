//! End-to-end throughput benchmark for Beacon.
//!
//! Drives the full outbound path of a logged-in client (delivery tracking,
//! send queue, connection manager) against an in-process server that
//! acknowledges every message, and reports acknowledged messages per second.

use beacon_client::api::{ApiError, PresenceApi};
use beacon_client::{AuthState, Client, Config};
use beacon_core::{ConnectionState, DeliveryState, Event, Topic};
use beacon_protocol::{AckState, Frame, RosterEntry};
use beacon_transport::MemoryTransport;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

/// Presence endpoints that always succeed with an empty roster.
struct QuietApi;

#[async_trait::async_trait]
impl PresenceApi for QuietApi {
    async fn heartbeat(&self, _credential: &str) -> Result<(), ApiError> {
        Ok(())
    }

    async fn fetch_roster(&self, _credential: &str) -> Result<Vec<RosterEntry>, ApiError> {
        Ok(Vec::new())
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let window = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(128usize);

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║         Beacon End-to-End Throughput Benchmark               ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("📊 In-flight window: {} messages", window);
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let (transport, mut server) = MemoryTransport::new();
    let mut config = Config::default();
    config.connection.queue_capacity = window.max(1) * 2;

    let client = Arc::new(Client::new(
        config,
        Arc::new(transport),
        Arc::new(QuietApi),
        AuthState::new(),
    ));
    client.login("bench").await;

    let Some(mut peer) = server.accept().await else {
        eprintln!("Client never connected");
        return;
    };
    client.wait_for_state(ConnectionState::Connected).await;
    println!("✓ Connected");

    // Server side: acknowledge every message as soon as it arrives.
    let server_task = tokio::spawn(async move {
        while let Some(frame) = peer.recv().await {
            if let Frame::Message {
                client_message_id, ..
            } = frame
            {
                peer.send(&Frame::delivery_ack(client_message_id, AckState::Delivered));
            }
        }
    });

    let delivered = Arc::new(AtomicU64::new(0));
    let credits = Arc::new(tokio::sync::Semaphore::new(window.max(1)));

    // Count acknowledgments and hand the window slot back.
    let counter_task = {
        let mut deliveries = client.subscribe(Topic::DeliveryChange);
        let delivered = Arc::clone(&delivered);
        let credits = Arc::clone(&credits);
        tokio::spawn(async move {
            while let Some(event) = deliveries.recv().await {
                if let Event::Delivery(change) = event.as_ref() {
                    if change.current.is_terminal() {
                        if change.current == DeliveryState::Delivered {
                            delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        credits.add_permits(1);
                    }
                }
            }
        })
    };

    let sender_task = {
        let client = Arc::clone(&client);
        let credits = Arc::clone(&credits);
        tokio::spawn(async move {
            let content = serde_json::json!({ "text": "x".repeat(64) });
            loop {
                let Ok(permit) = credits.acquire().await else {
                    break;
                };
                permit.forget();
                if let Err(e) = client.send_message("benchmark", content.clone()).await {
                    eprintln!("Send failed: {}", e);
                    break;
                }
            }
        })
    };

    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    delivered.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total = delivered.load(Ordering::SeqCst);
    let msgs_per_sec = total as f64 / elapsed.as_secs_f64();

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Window:               {:>10}                           ║",
        window
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!(
        "║  Acknowledged:         {:>10}                           ║",
        total
    );
    println!(
        "║  Throughput:           {:>10.0} msg/s                    ║",
        msgs_per_sec
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    sender_task.abort();
    counter_task.abort();
    client.logout().await;
    server_task.abort();
}
