use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::power_flow::AggregateSnapshot;

pub const HISTORY_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS power_flow_history (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    solar            REAL NOT NULL,
    grid             REAL NOT NULL,
    genset           REAL NOT NULL,
    load             REAL NOT NULL,
    timestamp        INTEGER NOT NULL,
    batch_id         TEXT,
    received_devices TEXT
)
"#;

pub const HISTORY_INDEX_DDL: &str =
    "CREATE INDEX IF NOT EXISTS idx_power_flow_history_timestamp ON power_flow_history (timestamp)";

/// "Last N minutes/hours" window for history reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryWindow {
    Minutes(u32),
    Hours(u32),
}

impl HistoryWindow {
    pub fn duration(&self) -> Duration {
        match self {
            HistoryWindow::Minutes(m) => Duration::minutes(i64::from(*m)),
            HistoryWindow::Hours(h) => Duration::hours(i64::from(*h)),
        }
    }

    pub fn since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.duration()
    }
}

/// One aggregate history entry as served to the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPoint {
    pub solar: f64,
    pub grid: f64,
    pub genset: f64,
    pub load: f64,
    pub batch_id: Option<String>,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct HistoryRow {
    solar: f64,
    grid: f64,
    genset: f64,
    load: f64,
    batch_id: Option<String>,
    timestamp: i64,
}

impl From<HistoryRow> for HistoryPoint {
    fn from(row: HistoryRow) -> Self {
        Self {
            solar: row.solar,
            grid: row.grid,
            genset: row.genset,
            load: row.load,
            batch_id: row.batch_id,
            time: DateTime::from_timestamp_millis(row.timestamp).unwrap_or_default(),
        }
    }
}

pub struct SnapshotRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SnapshotRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a single snapshot, returning its id
    pub async fn insert(
        &self,
        snapshot: &AggregateSnapshot,
        batch_id: &str,
        received_devices: &str,
    ) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO power_flow_history (
                solar, grid, genset, load, timestamp, batch_id, received_devices
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(snapshot.solar)
        .bind(snapshot.grid)
        .bind(snapshot.genset)
        .bind(snapshot.load)
        .bind(snapshot.timestamp.timestamp_millis())
        .bind(batch_id)
        .bind(received_devices)
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Snapshots at or after `start`, oldest first
    pub async fn find_since(&self, start: DateTime<Utc>) -> Result<Vec<HistoryPoint>, sqlx::Error> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT solar, grid, genset, load, batch_id, timestamp
            FROM power_flow_history
            WHERE timestamp >= ?
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(start.timestamp_millis())
        .fetch_all(self.pool)
        .await?;

        Ok(rows.into_iter().map(HistoryPoint::from).collect())
    }

    /// Delete snapshots strictly older than `cutoff`
    pub async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM power_flow_history WHERE timestamp < ?")
            .bind(cutoff.timestamp_millis())
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM power_flow_history")
            .fetch_one(self.pool)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_window_since() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(
            HistoryWindow::Minutes(15).since(now),
            Utc.with_ymd_and_hms(2024, 5, 1, 11, 45, 0).unwrap()
        );
        assert_eq!(
            HistoryWindow::Hours(2).since(now),
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_history_point_serialization() {
        let point = HistoryPoint {
            solar: 1.0,
            grid: 2.0,
            genset: 0.0,
            load: 3.0,
            batch_id: Some("b-1".to_string()),
            time: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        };
        let json = serde_json::to_value(&point).unwrap();
        assert_eq!(json["batchId"], "b-1");
        assert!(json["time"].is_string());
    }
}
