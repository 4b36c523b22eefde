//! End-to-end batch processing against a real SQLite file

mod common;

use energy_telemetry_hub::domain::DeviceConfig;
use energy_telemetry_hub::gateway::BroadcastGateway;
use energy_telemetry_hub::ingest::{BusMessage, MessageIngestor};
use energy_telemetry_hub::power_flow::AggregationEngine;
use energy_telemetry_hub::repo::{
    DeviceTableRepository, HistoryWindow, SqliteStore, TelemetryStore,
};
use energy_telemetry_hub::schema::{BlueprintCatalog, SchemaError, SchemaRegistry};
use energy_telemetry_hub::subscriptions::{Frame, RoomKey, SubscriptionRegistry};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

use common::{open_store, write_blueprints};

struct Hub {
    _dir: TempDir,
    store: Arc<SqliteStore>,
    schema: SchemaRegistry,
    subscriptions: Arc<SubscriptionRegistry>,
    ingestor: MessageIngestor,
}

async fn hub() -> Hub {
    let dir = TempDir::new().unwrap();
    let blueprints = dir.path().join("blueprints");
    std::fs::create_dir(&blueprints).unwrap();
    write_blueprints(&blueprints);

    let store = Arc::new(open_store(&dir).await);
    let schema = SchemaRegistry::new(
        BlueprintCatalog::new(&blueprints, 16, Duration::from_secs(60)),
        store.clone(),
    );
    let subscriptions = Arc::new(SubscriptionRegistry::new());
    let ingestor = MessageIngestor::new(
        Arc::new(AggregationEngine::new()),
        BroadcastGateway::new(subscriptions.clone()),
        store.clone(),
    );

    Hub {
        _dir: dir,
        store,
        schema,
        subscriptions,
        ingestor,
    }
}

fn device(name: &str, device_type: &str, reference: &str) -> DeviceConfig {
    DeviceConfig {
        name: name.to_string(),
        device_type: device_type.to_string(),
        reference: reference.to_string(),
        interface: None,
        protocol: None,
    }
}

fn message(batch_id: &str, ts: i64, entries: Vec<(&str, &str, Value)>) -> BusMessage {
    let data: Vec<Value> = entries
        .into_iter()
        .map(|(name, device_type, register)| {
            json!({
                "deviceMetaData": {"device_name": name, "device_type": device_type},
                "register": register
            })
        })
        .collect();
    serde_json::from_value(json!({
        "data": data,
        "metadata": {"batch_id": batch_id, "timestamp": ts.to_string()}
    }))
    .unwrap()
}

fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(serde_json::from_str(&frame).unwrap());
    }
    frames
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let hub = hub().await;
    let devices = vec![
        device("Inv1", "solar_inverter", "SUNSPEC-103"),
        device("Meter1", "grid_meter", "EM-24"),
        device("Ghost", "pv", "NO-SUCH-BLUEPRINT"),
    ];

    let first = hub.schema.reconcile(&devices).await;
    assert_eq!(first.created, vec!["Inv1", "Meter1"]);
    assert_eq!(first.failed.len(), 1);
    assert_eq!(first.failed[0].device, "Ghost");

    let second = hub.schema.reconcile(&devices).await;
    assert!(second.created.is_empty());
    assert_eq!(second.existing, vec!["Inv1", "Meter1"]);

    let registered = DeviceTableRepository::new(hub.store.pool())
        .find_all()
        .await
        .unwrap();
    assert_eq!(registered.len(), 2);
}

#[tokio::test]
async fn test_create_table_errors_surface_to_caller() {
    let hub = hub().await;

    let err = hub.schema.create_table("X", "MISSING").await.unwrap_err();
    assert!(matches!(err, SchemaError::BlueprintNotFound(r) if r == "MISSING"));

    let table = hub.schema.create_table("Gen1", "DSE-7320").await.unwrap();
    assert_eq!(table, "device_gen1");
    assert_eq!(hub.schema.create_table("Gen1", "MISSING").await.unwrap(), table);
}

#[tokio::test]
async fn test_batches_roll_up_broadcast_and_persist() {
    let hub = hub().await;
    hub.schema
        .reconcile(&[
            device("Inv1", "solar_inverter", "SUNSPEC-103"),
            device("Meter1", "grid_meter", "EM-24"),
            device("Gen1", "genset", "DSE-7320"),
        ])
        .await;

    let (tx, mut watcher) = mpsc::channel(32);
    let client = hub.subscriptions.connect(tx);
    hub.subscriptions.join(client, &RoomKey::device("Inv1")).unwrap();
    hub.subscriptions.join(client, &RoomKey::PowerFlow).unwrap();

    let (tx, mut bystander) = mpsc::channel(32);
    hub.subscriptions.connect(tx);

    let now = chrono::Utc::now().timestamp_millis();
    let first = hub
        .ingestor
        .ingest(message(
            "b1",
            now - 2_000,
            vec![
                ("Inv1", "solar_inverter", json!({"W": 100})),
                ("Meter1", "grid_meter", json!({"W": 50})),
                ("Gen1", "genset", json!({"W": 0})),
            ],
        ))
        .await;
    assert_eq!(first.snapshot.load, 150.0);
    assert_eq!(first.persistence_failures(), 0);

    let second = hub
        .ingestor
        .ingest(message(
            "b2",
            now - 1_000,
            vec![(
                "Inv1",
                "solar_inverter",
                json!({"W": "null", "WphA": "10", "WphB": "10", "WphC": "10"}),
            )],
        ))
        .await;
    assert_eq!(second.snapshot.solar, 30.0);
    assert_eq!(second.snapshot.grid, 50.0);
    assert_eq!(second.snapshot.load, 80.0);

    let frames = drain(&mut watcher);
    let device_frames: Vec<_> = frames.iter().filter(|f| f["event"] == "sensor-data").collect();
    let aggregate_frames: Vec<_> = frames.iter().filter(|f| f["event"] == "power-flow").collect();
    assert_eq!(device_frames.len(), 2);
    assert_eq!(aggregate_frames.len(), 2);
    assert_eq!(device_frames[1]["data"]["W"], Value::Null);
    assert_eq!(aggregate_frames[1]["data"]["receivedDevices"]["grid"], false);
    assert!(drain(&mut bystander).is_empty());

    let history = hub.store.history(HistoryWindow::Minutes(5)).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].batch_id.as_deref(), Some("b1"));
    assert_eq!(history[1].load, 80.0);

    let inverter = hub.store.device_table("Inv1").unwrap();
    let rows = DeviceTableRepository::new(hub.store.pool())
        .count_rows(&inverter)
        .await
        .unwrap();
    assert_eq!(rows, 2);
}

#[tokio::test]
async fn test_replayed_batch_skips_device_rows() {
    let hub = hub().await;
    hub.schema.create_table("Meter1", "EM-24").await.unwrap();
    let batch = || message("b1", 1_700_000_000_000, vec![("Meter1", "meter", json!({"W": -25.5}))]);

    let first = hub.ingestor.ingest(batch()).await;
    let replay = hub.ingestor.ingest(batch()).await;

    assert!(first.device_rows[0].1.is_stored());
    assert!(!replay.device_rows[0].1.is_stored());
    assert!(!replay.device_rows[0].1.is_failed());
    assert_eq!(replay.snapshot.grid, -25.5);
}
