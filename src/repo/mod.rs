use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::domain::RegisterMap;
use crate::power_flow::AggregateSnapshot;
use crate::schema::DeviceSchema;

pub mod device_tables;
pub mod retry;
pub mod snapshots;
pub mod sqlite;

pub use device_tables::{DeviceTable, DeviceTableRepository};
pub use retry::RetryPolicy;
pub use snapshots::{HistoryPoint, HistoryWindow, SnapshotRepository};
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("store busy: {operation} gave up after {attempts} attempts")]
    Busy {
        operation: &'static str,
        attempts: u32,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Soft result of a best-effort write
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PersistOutcome {
    Stored,
    Skipped { reason: String },
    Failed { attempts: u32, error: String },
}

impl PersistOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, PersistOutcome::Stored)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, PersistOutcome::Failed { .. })
    }

    pub(crate) fn from_error(error: StorageError) -> Self {
        let attempts = match &error {
            StorageError::Busy { attempts, .. } => *attempts,
            _ => 1,
        };
        PersistOutcome::Failed {
            attempts,
            error: error.to_string(),
        }
    }
}

/// Everything the pipeline needs from persistent storage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Create the device's table from `schema` unless one is registered already
    async fn ensure_device_table(
        &self,
        device_name: &str,
        schema: &DeviceSchema,
    ) -> Result<DeviceTable, StorageError>;

    async fn drop_device_table(&self, device_name: &str) -> Result<bool, StorageError>;

    fn device_table(&self, device_name: &str) -> Option<DeviceTable>;

    async fn insert_device_row(
        &self,
        device_name: &str,
        timestamp: DateTime<Utc>,
        registers: &RegisterMap,
    ) -> PersistOutcome;

    async fn insert_snapshot(&self, snapshot: &AggregateSnapshot, batch_id: &str) -> PersistOutcome;

    async fn history(&self, window: HistoryWindow) -> Result<Vec<HistoryPoint>, StorageError>;

    /// Delete aggregate history strictly older than `cutoff`
    async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError>;

    async fn health_check(&self) -> Result<(), StorageError>;
}
