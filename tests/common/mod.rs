#![allow(dead_code)]
use energy_telemetry_hub::domain::{RegisterMap, RegisterValue};
use energy_telemetry_hub::repo::{RetryPolicy, SqliteStore};
use energy_telemetry_hub::schema::{ColumnDescriptor, DeviceSchema};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

pub fn sqlite_options(dir: &Path) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(dir.join("telemetry.db"))
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::ZERO)
}

pub async fn open_store(dir: &TempDir) -> SqliteStore {
    SqliteStore::connect_with(
        sqlite_options(dir.path()),
        2,
        RetryPolicy::new(2, Duration::from_millis(5)),
    )
    .await
    .expect("open store")
}

pub fn schema(reference: &str, registers: &[&str]) -> DeviceSchema {
    DeviceSchema {
        reference: reference.to_string(),
        device_type: None,
        columns: registers
            .iter()
            .map(|r| ColumnDescriptor {
                register: r.to_string(),
                column: r.to_string(),
            })
            .collect(),
    }
}

pub fn registers(values: &[(&str, Option<f64>)]) -> RegisterMap {
    values
        .iter()
        .map(|(k, v)| (k.to_string(), RegisterValue(*v)))
        .collect()
}

pub fn write_blueprints(dir: &Path) {
    std::fs::write(
        dir.join("inverter.json"),
        r#"{"reference":"SUNSPEC-103","header":{"type":"solar_inverter"},
            "registers":[{"shortName":"W"},{"shortName":"WphA"},{"shortName":"WphB"},{"shortName":"WphC"}]}"#,
    )
    .unwrap();
    std::fs::write(
        dir.join("meter.yaml"),
        "reference: EM-24\nheader:\n  type: grid_meter\nregisters:\n  - shortName: W\n",
    )
    .unwrap();
    std::fs::write(
        dir.join("genset.yaml"),
        "reference: DSE-7320\nregisters:\n  - shortName: W\n  - shortName: Hz\n",
    )
    .unwrap();
}
