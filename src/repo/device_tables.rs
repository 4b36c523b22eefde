use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::domain::RegisterMap;
use crate::schema::{sanitize_identifier, ColumnDescriptor, DeviceSchema};

pub const DEVICE_TABLES_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS device_tables (
    device_name TEXT PRIMARY KEY,
    table_name  TEXT NOT NULL UNIQUE,
    reference   TEXT,
    columns     TEXT NOT NULL,
    created_at  INTEGER NOT NULL
)
"#;

/// A registered per-device time series table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTable {
    pub device_name: String,
    pub table_name: String,
    pub reference: Option<String>,
    /// Frozen at creation time
    pub columns: Vec<ColumnDescriptor>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct DeviceTableRow {
    device_name: String,
    table_name: String,
    reference: Option<String>,
    columns: String,
}

impl TryFrom<DeviceTableRow> for DeviceTable {
    type Error = serde_json::Error;

    fn try_from(row: DeviceTableRow) -> Result<Self, Self::Error> {
        Ok(Self {
            device_name: row.device_name,
            table_name: row.table_name,
            reference: row.reference,
            columns: serde_json::from_str(&row.columns)?,
        })
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Base table name for a device; uniqueness is resolved at creation
pub fn base_table_name(device_name: &str) -> String {
    format!("device_{}", sanitize_identifier(&device_name.to_ascii_lowercase()))
}

/// `CREATE TABLE` statement for a device's time series
pub fn create_table_sql(table_name: &str, columns: &[ColumnDescriptor]) -> String {
    let register_columns = columns
        .iter()
        .map(|c| format!("{} REAL", quote(&c.column)))
        .join(", ");
    let separator = if columns.is_empty() { "" } else { ", " };
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\"timestamp\" INTEGER PRIMARY KEY{}{}, \"sample_count\" INTEGER NOT NULL DEFAULT 1)",
        quote(table_name),
        separator,
        register_columns
    )
}

fn insert_row_sql(table_name: &str, columns: &[&ColumnDescriptor]) -> String {
    let names = std::iter::once("\"timestamp\"".to_string())
        .chain(columns.iter().map(|c| quote(&c.column)))
        .chain(std::iter::once("\"sample_count\"".to_string()))
        .join(", ");
    let params = std::iter::repeat("?").take(columns.len() + 2).join(", ");
    format!("INSERT INTO {} ({}) VALUES ({})", quote(table_name), names, params)
}

pub struct DeviceTableRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> DeviceTableRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find_all(&self) -> Result<Vec<DeviceTable>, sqlx::Error> {
        let rows = sqlx::query_as::<_, DeviceTableRow>(
            "SELECT device_name, table_name, reference, columns FROM device_tables ORDER BY device_name",
        )
        .fetch_all(self.pool)
        .await?;

        rows.into_iter()
            .map(|r| DeviceTable::try_from(r).map_err(|e| sqlx::Error::Decode(Box::new(e))))
            .collect()
    }

    /// Register and create the table unless the device already has one
    ///
    /// Runs in one transaction so a concurrent reconcile cannot register the
    /// same device twice.
    pub async fn ensure(
        &self,
        device_name: &str,
        schema: &DeviceSchema,
    ) -> Result<DeviceTable, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        if let Some(existing) = find_in(&mut tx, device_name).await? {
            tx.commit().await?;
            return Ok(existing);
        }

        let table_name = free_table_name(&mut tx, &base_table_name(device_name)).await?;
        let columns_json = serde_json::to_string(&schema.columns)
            .map_err(|e| sqlx::Error::Protocol(e.to_string()))?;

        sqlx::query(&create_table_sql(&table_name, &schema.columns))
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO device_tables (device_name, table_name, reference, columns, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(device_name) DO NOTHING",
        )
        .bind(device_name)
        .bind(&table_name)
        .bind(&schema.reference)
        .bind(&columns_json)
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(DeviceTable {
            device_name: device_name.to_string(),
            table_name,
            reference: Some(schema.reference.clone()),
            columns: schema.columns.clone(),
        })
    }

    /// Drop the device's table and unregister it; false if it was not registered
    pub async fn remove(&self, device_name: &str) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let Some(existing) = find_in(&mut tx, device_name).await? else {
            tx.commit().await?;
            return Ok(false);
        };

        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote(&existing.table_name)))
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM device_tables WHERE device_name = ?")
            .bind(device_name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Append one row; only registers that have a column are written
    ///
    /// Returns the number of register columns written, or `None` when the
    /// reading has none of the table's registers.
    pub async fn insert_row(
        &self,
        table: &DeviceTable,
        timestamp: DateTime<Utc>,
        registers: &RegisterMap,
    ) -> Result<Option<usize>, sqlx::Error> {
        let present: Vec<&ColumnDescriptor> = table
            .columns
            .iter()
            .filter(|c| registers.contains_key(&c.register))
            .collect();
        if present.is_empty() {
            return Ok(None);
        }

        let sql = insert_row_sql(&table.table_name, &present);
        let mut query = sqlx::query(&sql).bind(timestamp.timestamp_millis());
        for column in &present {
            query = query.bind(registers.get(&column.register).and_then(|v| v.value()));
        }
        query.bind(1_i64).execute(self.pool).await?;

        Ok(Some(present.len()))
    }

    pub async fn count_rows(&self, table: &DeviceTable) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", quote(&table.table_name)))
            .fetch_one(self.pool)
            .await
    }
}

async fn find_in(
    tx: &mut Transaction<'_, Sqlite>,
    device_name: &str,
) -> Result<Option<DeviceTable>, sqlx::Error> {
    let row = sqlx::query_as::<_, DeviceTableRow>(
        "SELECT device_name, table_name, reference, columns FROM device_tables WHERE device_name = ?",
    )
    .bind(device_name)
    .fetch_optional(&mut **tx)
    .await?;

    row.map(DeviceTable::try_from)
        .transpose()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

async fn free_table_name(
    tx: &mut Transaction<'_, Sqlite>,
    base: &str,
) -> Result<String, sqlx::Error> {
    let mut candidate = base.to_string();
    let mut n = 2;
    loop {
        let counts: Vec<i64> = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?
             UNION ALL SELECT COUNT(*) FROM device_tables WHERE table_name = ?",
        )
        .bind(&candidate)
        .bind(&candidate)
        .fetch_all(&mut **tx)
        .await?;
        let taken: i64 = counts.into_iter().sum();
        if taken == 0 {
            return Ok(candidate);
        }
        candidate = format!("{}_{}", base, n);
        n += 1;
    }
}
