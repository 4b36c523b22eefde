//! Bus message ingestion
//!
//! A batch is decoded, every valid reading is pushed raw to its device room,
//! the readings are folded into the aggregate and the snapshot is broadcast.
//! Persistence runs last and never holds back a broadcast.

pub mod message;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use message::{decode_batch, BatchMetadata, BusMessage, DecodedBatch};

use crate::gateway::BroadcastGateway;
use crate::power_flow::{AggregateSnapshot, AggregationEngine};
use crate::repo::{PersistOutcome, TelemetryStore};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("message is not a valid bus message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("ingest queue is full")]
    QueueFull,
    #[error("ingest queue is closed")]
    QueueClosed,
}

/// What happened to one batch
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub batch_id: String,
    pub accepted: usize,
    pub skipped: usize,
    /// Device pushes that found a subscribed room
    pub device_pushes: usize,
    pub aggregate_pushed: bool,
    pub snapshot: AggregateSnapshot,
    pub device_rows: Vec<(String, PersistOutcome)>,
    pub snapshot_row: PersistOutcome,
}

impl BatchReport {
    pub fn persistence_failures(&self) -> usize {
        self.device_rows
            .iter()
            .map(|(_, o)| o)
            .chain(std::iter::once(&self.snapshot_row))
            .filter(|o| o.is_failed())
            .count()
    }
}

pub struct MessageIngestor {
    engine: Arc<AggregationEngine>,
    gateway: BroadcastGateway,
    store: Arc<dyn TelemetryStore>,
}

impl MessageIngestor {
    pub fn new(
        engine: Arc<AggregationEngine>,
        gateway: BroadcastGateway,
        store: Arc<dyn TelemetryStore>,
    ) -> Self {
        Self {
            engine,
            gateway,
            store,
        }
    }

    pub fn engine(&self) -> &Arc<AggregationEngine> {
        &self.engine
    }

    /// Parse a raw message body; only a body that is not a message at all fails
    pub fn decode(bytes: &[u8]) -> Result<BusMessage, IngestError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub async fn ingest_bytes(&self, bytes: &[u8]) -> Result<BatchReport, IngestError> {
        let message = Self::decode(bytes)?;
        Ok(self.ingest(message).await)
    }

    pub async fn ingest(&self, message: BusMessage) -> BatchReport {
        self.ingest_at(message, Utc::now()).await
    }

    pub async fn ingest_at(&self, message: BusMessage, received_at: DateTime<Utc>) -> BatchReport {
        let batch = decode_batch(&message, received_at);

        let device_pushes = batch
            .readings
            .iter()
            .filter(|r| self.gateway.push_device(r, received_at))
            .count();

        let aggregate = self.engine.apply(&batch.readings, batch.timestamp);
        let aggregate_pushed = self.gateway.push_aggregate(&aggregate.snapshot);

        let mut device_rows = Vec::with_capacity(batch.readings.len());
        for reading in &batch.readings {
            let outcome = self
                .store
                .insert_device_row(&reading.device_name, reading.timestamp, &reading.registers)
                .await;
            device_rows.push((reading.device_name.clone(), outcome));
        }
        let snapshot_row = self
            .store
            .insert_snapshot(&aggregate.snapshot, &batch.batch_id)
            .await;

        let report = BatchReport {
            batch_id: batch.batch_id,
            accepted: batch.readings.len(),
            skipped: batch.skipped,
            device_pushes,
            aggregate_pushed,
            snapshot: aggregate.snapshot,
            device_rows,
            snapshot_row,
        };

        let failures = report.persistence_failures();
        if failures > 0 {
            warn!(batch_id = %report.batch_id, failures, "batch broadcast but not fully persisted");
        }
        debug!(
            batch_id = %report.batch_id,
            accepted = report.accepted,
            skipped = report.skipped,
            device_pushes = report.device_pushes,
            aggregate_pushed = report.aggregate_pushed,
            snapshot = %report.snapshot,
            "batch ingested"
        );
        report
    }
}

/// Producer side of the ingest queue
#[derive(Clone)]
pub struct IngestQueue {
    sender: mpsc::Sender<BusMessage>,
}

impl IngestQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<BusMessage>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    pub fn enqueue(&self, message: BusMessage) -> Result<(), IngestError> {
        self.sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => IngestError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => IngestError::QueueClosed,
        })
    }
}

/// Process queued batches one at a time, in arrival order
///
/// On cancellation the receiver is closed and whatever is already queued is
/// still processed before returning.
pub async fn run_ingest_loop(
    ingestor: Arc<MessageIngestor>,
    mut receiver: mpsc::Receiver<BusMessage>,
    shutdown: CancellationToken,
) -> usize {
    let mut processed = 0;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            message = receiver.recv() => match message {
                Some(message) => {
                    ingestor.ingest(message).await;
                    processed += 1;
                }
                None => return processed,
            },
        }
    }

    receiver.close();
    let mut drained = 0;
    while let Some(message) = receiver.recv().await {
        ingestor.ingest(message).await;
        drained += 1;
    }
    info!(processed, drained, "ingest loop stopped");
    processed + drained
}
