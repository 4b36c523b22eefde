use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::Config;
use crate::domain::DeviceConfig;
use crate::gateway::BroadcastGateway;
use crate::ingest::{run_ingest_loop, BusMessage, IngestQueue, MessageIngestor};
use crate::power_flow::AggregationEngine;
use crate::repo::{StorageError, TelemetryStore};
use crate::schema::{BlueprintCatalog, SchemaRegistry};
use crate::subscriptions::SubscriptionRegistry;

/// Shared handles for the HTTP/websocket adapters
#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub store: Arc<dyn TelemetryStore>,
    pub schema: Arc<SchemaRegistry>,
    pub subscriptions: Arc<SubscriptionRegistry>,
    pub engine: Arc<AggregationEngine>,
    pub ingest: IngestQueue,
    pub devices: Arc<Vec<DeviceConfig>>,
}

/// Consumer half of the ingest queue, handed to the background ingest task
pub struct IngestWorker {
    ingestor: Arc<MessageIngestor>,
    receiver: mpsc::Receiver<BusMessage>,
}

impl AppState {
    pub fn new(
        cfg: Config,
        store: Arc<dyn TelemetryStore>,
        devices: Vec<DeviceConfig>,
    ) -> (Self, IngestWorker) {
        let subscriptions = Arc::new(SubscriptionRegistry::new());
        let engine = Arc::new(AggregationEngine::new());
        let schema = Arc::new(SchemaRegistry::new(
            BlueprintCatalog::from_config(&cfg.blueprints),
            store.clone(),
        ));
        let ingestor = Arc::new(MessageIngestor::new(
            engine.clone(),
            BroadcastGateway::new(subscriptions.clone()),
            store.clone(),
        ));
        let (ingest, receiver) = IngestQueue::bounded(cfg.ingest.queue_capacity);

        let state = Self {
            cfg: Arc::new(cfg),
            store,
            schema,
            subscriptions,
            engine,
            ingest,
            devices: Arc::new(devices),
        };
        (state, IngestWorker { ingestor, receiver })
    }
}

/// Start the ingest and retention loops; both stop when `shutdown` fires
pub fn spawn_background_tasks(
    state: &AppState,
    worker: IngestWorker,
    shutdown: CancellationToken,
) -> TaskTracker {
    let tracker = TaskTracker::new();

    let ingest_shutdown = shutdown.clone();
    tracker.spawn(async move {
        run_ingest_loop(worker.ingestor, worker.receiver, ingest_shutdown).await;
    });

    let store = state.store.clone();
    let retention_days = state.cfg.storage.retention_days;
    let every = Duration::from_secs(state.cfg.storage.cleanup_interval_minutes.max(1) * 60);
    tracker.spawn(async move {
        retention_loop(store, retention_days, every, shutdown).await;
    });

    tracker.close();
    tracker
}

pub async fn retention_loop(
    store: Arc<dyn TelemetryStore>,
    retention_days: u32,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = run_retention(store.as_ref(), retention_days, Utc::now()).await {
                    warn!(error = %e, "retention cleanup failed");
                }
            }
        }
    }
    info!("retention loop stopped");
}

/// Remove aggregate history older than `retention_days` before `now`
pub async fn run_retention(
    store: &dyn TelemetryStore,
    retention_days: u32,
    now: DateTime<Utc>,
) -> Result<u64, StorageError> {
    let cutoff = now - ChronoDuration::days(i64::from(retention_days));
    store.cleanup_older_than(cutoff).await
}
