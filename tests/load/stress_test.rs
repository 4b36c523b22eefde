#![cfg(test)]
//! Load testing for the ingest and broadcast path
//!
//! - Many websocket-like clients joining and leaving while batches stream in
//! - Ingest latency with slow consumers that never drain their channels
//! - Raw batch throughput
//!
//! Key performance requirements:
//! - A batch must not wait on slow subscribers
//! - Room counts return to zero once every client is gone

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use energy_telemetry_hub::domain::RegisterMap;
use energy_telemetry_hub::gateway::BroadcastGateway;
use energy_telemetry_hub::ingest::{BusMessage, MessageIngestor};
use energy_telemetry_hub::power_flow::{AggregateSnapshot, AggregationEngine};
use energy_telemetry_hub::repo::{
    DeviceTable, HistoryPoint, HistoryWindow, PersistOutcome, StorageError, TelemetryStore,
};
use energy_telemetry_hub::schema::DeviceSchema;
use energy_telemetry_hub::subscriptions::{RoomKey, SubscriptionRegistry};

/// Store that accepts every write and keeps nothing
struct NullStore;

#[async_trait]
impl TelemetryStore for NullStore {
    async fn ensure_device_table(
        &self,
        device_name: &str,
        schema: &DeviceSchema,
    ) -> Result<DeviceTable, StorageError> {
        Ok(DeviceTable {
            device_name: device_name.to_string(),
            table_name: format!("device_{}", device_name),
            reference: Some(schema.reference.clone()),
            columns: schema.columns.clone(),
        })
    }

    async fn drop_device_table(&self, _device_name: &str) -> Result<bool, StorageError> {
        Ok(false)
    }

    fn device_table(&self, _device_name: &str) -> Option<DeviceTable> {
        None
    }

    async fn insert_device_row(
        &self,
        _device_name: &str,
        _timestamp: DateTime<Utc>,
        _registers: &RegisterMap,
    ) -> PersistOutcome {
        PersistOutcome::Stored
    }

    async fn insert_snapshot(&self, _snapshot: &AggregateSnapshot, _batch_id: &str) -> PersistOutcome {
        PersistOutcome::Stored
    }

    async fn history(&self, _window: HistoryWindow) -> Result<Vec<HistoryPoint>, StorageError> {
        Ok(Vec::new())
    }

    async fn cleanup_older_than(&self, _cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        Ok(0)
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

fn build_ingestor() -> (Arc<MessageIngestor>, Arc<SubscriptionRegistry>) {
    let subscriptions = Arc::new(SubscriptionRegistry::new());
    let ingestor = MessageIngestor::new(
        Arc::new(AggregationEngine::new()),
        BroadcastGateway::new(subscriptions.clone()),
        Arc::new(NullStore),
    );
    (Arc::new(ingestor), subscriptions)
}

fn batch(seq: usize, devices: usize) -> BusMessage {
    let data: Vec<_> = (0..devices)
        .map(|d| {
            let device_type = match d % 3 {
                0 => "solar_inverter",
                1 => "grid_meter",
                _ => "genset",
            };
            json!({
                "deviceMetaData": {"device_name": format!("dev{d}"), "device_type": device_type},
                "register": {"W": (seq + d) as f64}
            })
        })
        .collect();
    serde_json::from_value(json!({"data": data, "metadata": {"batch_id": format!("b{seq}")}})).unwrap()
}

/// Test: Subscription churn while batches stream in
///
/// Clients join and leave device rooms concurrently with ingestion; once they
/// are all gone no room may be left behind.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Ignore by default as this is a slow test
async fn test_subscription_churn_during_ingest() {
    let (ingestor, subscriptions) = build_ingestor();

    let producer = {
        let ingestor = Arc::clone(&ingestor);
        tokio::spawn(async move {
            for seq in 0..500 {
                ingestor.ingest(batch(seq, 30)).await;
            }
        })
    };

    let mut clients = JoinSet::new();
    for i in 0..50 {
        let subscriptions = Arc::clone(&subscriptions);
        clients.spawn(async move {
            let (tx, mut rx) = mpsc::channel(16);
            let client = subscriptions.connect(tx);
            for round in 0..100 {
                let room = RoomKey::device(format!("dev{}", (i + round) % 30));
                subscriptions.join(client, &room);
                subscriptions.join(client, &RoomKey::PowerFlow);
                while rx.try_recv().is_ok() {}
                subscriptions.leave(client, &room);
                tokio::task::yield_now().await;
            }
            subscriptions.disconnect(client);
        });
    }

    while clients.join_next().await.is_some() {}
    producer.await.unwrap();

    assert_eq!(subscriptions.room_count(), 0);
    assert_eq!(subscriptions.client_count(), 0);
}

/// Test: Slow consumers never hold back a batch
#[tokio::test]
#[ignore] // Ignore by default as this is a slow test
async fn test_ingest_latency_with_slow_consumers() {
    let (ingestor, subscriptions) = build_ingestor();

    // Receivers are kept alive but never read, so every channel fills up
    let mut stalled = Vec::new();
    for d in 0..30 {
        let (tx, rx) = mpsc::channel(1);
        let client = subscriptions.connect(tx);
        subscriptions.join(client, &RoomKey::device(format!("dev{d}")));
        subscriptions.join(client, &RoomKey::PowerFlow);
        stalled.push(rx);
    }

    let mut latencies = Vec::new();
    for seq in 0..200 {
        let start = Instant::now();
        ingestor.ingest(batch(seq, 30)).await;
        latencies.push(start.elapsed());
    }

    let max_latency = latencies.iter().max().unwrap();
    let avg_latency: Duration = latencies.iter().sum::<Duration>() / latencies.len() as u32;
    println!("Batch latency - Max: {:?}, Avg: {:?}", max_latency, avg_latency);

    assert!(
        *max_latency < Duration::from_millis(250),
        "Batch latency exceeded 250ms: {:?}",
        max_latency
    );
    assert_eq!(stalled.len(), 30);
}

/// Test: Throughput benchmark
#[tokio::test]
#[ignore] // Ignore by default as this is a slow test
async fn test_throughput_benchmark() {
    let (ingestor, subscriptions) = build_ingestor();
    let (tx, mut rx) = mpsc::channel(1024);
    let client = subscriptions.connect(tx);
    subscriptions.join(client, &RoomKey::PowerFlow);

    let start = Instant::now();
    let test_duration = Duration::from_secs(3);
    let mut batches = 0usize;

    while start.elapsed() < test_duration {
        ingestor.ingest(batch(batches, 10)).await;
        batches += 1;
        while rx.try_recv().is_ok() {}
    }

    let elapsed = start.elapsed();
    let per_second = batches as f64 / elapsed.as_secs_f64();
    println!(
        "Throughput: {:.0} batches/second ({} batches in {:?})",
        per_second, batches, elapsed
    );

    assert!(per_second > 100.0, "Throughput too low: {:.0} batches/s", per_second);
}
