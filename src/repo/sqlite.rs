use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::device_tables::DEVICE_TABLES_DDL;
use super::retry::is_unique_violation;
use super::snapshots::{HISTORY_DDL, HISTORY_INDEX_DDL};
use super::{
    DeviceTable, DeviceTableRepository, HistoryPoint, HistoryWindow, PersistOutcome, RetryPolicy,
    SnapshotRepository, StorageError, TelemetryStore,
};
use crate::config::StorageConfig;
use crate::domain::RegisterMap;
use crate::power_flow::AggregateSnapshot;
use crate::schema::DeviceSchema;

/// SQLite-backed store with an in-memory mirror of the device table registry
pub struct SqliteStore {
    pool: SqlitePool,
    retry: RetryPolicy,
    tables: RwLock<HashMap<String, DeviceTable>>,
}

impl SqliteStore {
    pub async fn connect(cfg: &StorageConfig) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(&cfg.database_url)?;
        if let Some(parent) = options
            .get_filename()
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(cfg.busy_timeout_ms));
        let retry = RetryPolicy::new(cfg.busy_retries, Duration::from_millis(cfg.busy_backoff_ms));

        info!(url = %cfg.database_url, "opening telemetry store");
        Self::connect_with(options, cfg.max_connections, retry).await
    }

    pub async fn connect_with(
        options: SqliteConnectOptions,
        max_connections: u32,
        retry: RetryPolicy,
    ) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        migrate(&pool).await?;

        let registered = DeviceTableRepository::new(&pool).find_all().await?;
        let tables = registered
            .into_iter()
            .map(|t| (t.device_name.clone(), t))
            .collect::<HashMap<_, _>>();
        info!(device_tables = tables.len(), "telemetry store ready");

        Ok(Self {
            pool,
            retry,
            tables: RwLock::new(tables),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }


    pub async fn close(&self) {
        info!("closing telemetry store");
        self.pool.close().await;
    }

    fn write_outcome(&self, operation: &str, result: Result<(), StorageError>) -> PersistOutcome {
        match result {
            Ok(()) => PersistOutcome::Stored,
            Err(StorageError::Database(e)) if is_unique_violation(&e) => {
                warn!(operation, error = %e, "duplicate timestamp, row skipped");
                PersistOutcome::Skipped {
                    reason: "duplicate timestamp".to_string(),
                }
            }
            Err(e) => {
                warn!(operation, error = %e, "write failed");
                PersistOutcome::from_error(e)
            }
        }
    }
}

async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for ddl in [DEVICE_TABLES_DDL, HISTORY_DDL, HISTORY_INDEX_DDL] {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}

#[async_trait]
impl TelemetryStore for SqliteStore {
    async fn ensure_device_table(
        &self,
        device_name: &str,
        schema: &DeviceSchema,
    ) -> Result<DeviceTable, StorageError> {
        if let Some(existing) = self.device_table(device_name) {
            return Ok(existing);
        }

        let repo = DeviceTableRepository::new(&self.pool);
        let table = self
            .retry
            .run("create device table", || repo.ensure(device_name, schema))
            .await?;

        self.tables
            .write()
            .insert(device_name.to_string(), table.clone());
        Ok(table)
    }

    async fn drop_device_table(&self, device_name: &str) -> Result<bool, StorageError> {
        let repo = DeviceTableRepository::new(&self.pool);
        let dropped = self
            .retry
            .run("drop device table", || repo.remove(device_name))
            .await?;

        self.tables.write().remove(device_name);
        Ok(dropped)
    }

    fn device_table(&self, device_name: &str) -> Option<DeviceTable> {
        self.tables.read().get(device_name).cloned()
    }

    async fn insert_device_row(
        &self,
        device_name: &str,
        timestamp: DateTime<Utc>,
        registers: &RegisterMap,
    ) -> PersistOutcome {
        let Some(table) = self.device_table(device_name) else {
            debug!(device = device_name, "no table registered, row skipped");
            return PersistOutcome::Skipped {
                reason: "no table registered".to_string(),
            };
        };

        let repo = DeviceTableRepository::new(&self.pool);
        let result = self
            .retry
            .run("insert device row", || repo.insert_row(&table, timestamp, registers))
            .await;

        match result {
            Ok(Some(_)) => PersistOutcome::Stored,
            Ok(None) => PersistOutcome::Skipped {
                reason: "no known registers".to_string(),
            },
            Err(e) => self.write_outcome("insert device row", Err(e)),
        }
    }

    async fn insert_snapshot(&self, snapshot: &AggregateSnapshot, batch_id: &str) -> PersistOutcome {
        let received = match serde_json::to_string(&snapshot.received_devices) {
            Ok(json) => json,
            Err(e) => return PersistOutcome::from_error(e.into()),
        };

        let repo = SnapshotRepository::new(&self.pool);
        let result = self
            .retry
            .run("insert snapshot", || repo.insert(snapshot, batch_id, &received))
            .await
            .map(|_| ());

        self.write_outcome("insert snapshot", result)
    }

    async fn history(&self, window: HistoryWindow) -> Result<Vec<HistoryPoint>, StorageError> {
        let since = window.since(Utc::now());
        let repo = SnapshotRepository::new(&self.pool);
        self.retry.run("read history", || repo.find_since(since)).await
    }

    async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let repo = SnapshotRepository::new(&self.pool);
        let deleted = self
            .retry
            .run("retention cleanup", || repo.cleanup_older_than(cutoff))
            .await?;

        if deleted > 0 {
            info!(deleted, cutoff = %cutoff, "aggregate history trimmed");
        }
        Ok(deleted)
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
