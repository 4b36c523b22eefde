//! Per-device schema derivation and device table lifecycle
//!
//! Blueprints are looked up by reference in a directory of JSON/YAML documents.
//! The derived column layout is handed to the store exactly once, when the
//! device's table is created; later blueprint edits never touch existing tables.

pub mod blueprint;
pub mod cache;

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use blueprint::{sanitize_identifier, Blueprint, ColumnDescriptor, DeviceSchema};
pub use cache::SchemaCache;

use crate::config::BlueprintConfig;
use crate::domain::DeviceConfig;
use crate::repo::{StorageError, TelemetryStore};

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("no blueprint found for reference '{0}'")]
    BlueprintNotFound(String),
    #[error("blueprint '{0}' declares no registers")]
    SchemaIncomplete(String),
    #[error("blueprint directory unreadable: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Blueprint lookup over a directory, fronted by a bounded TTL cache
pub struct BlueprintCatalog {
    directory: PathBuf,
    cache: SchemaCache,
}

impl BlueprintCatalog {
    pub fn new(directory: impl Into<PathBuf>, cache_capacity: usize, ttl: Duration) -> Self {
        Self {
            directory: directory.into(),
            cache: SchemaCache::new(cache_capacity, ttl),
        }
    }

    pub fn from_config(cfg: &BlueprintConfig) -> Self {
        Self::new(
            &cfg.directory,
            cfg.cache_capacity,
            Duration::from_secs(cfg.cache_ttl_secs),
        )
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn cache(&self) -> &SchemaCache {
        &self.cache
    }

    /// Schema for `reference`, from cache or by scanning the directory
    pub async fn lookup(&self, reference: &str) -> Result<Arc<DeviceSchema>, SchemaError> {
        if let Some(schema) = self.cache.get(reference) {
            return Ok(schema);
        }

        let blueprint = self
            .scan(reference)
            .await?
            .ok_or_else(|| SchemaError::BlueprintNotFound(reference.to_string()))?;

        let schema = DeviceSchema::from_blueprint(&blueprint);
        if schema.is_empty() {
            return Err(SchemaError::SchemaIncomplete(reference.to_string()));
        }

        let schema = Arc::new(schema);
        self.cache.insert(reference, schema.clone());
        debug!(reference, columns = schema.columns.len(), "blueprint loaded");
        Ok(schema)
    }

    async fn scan(&self, reference: &str) -> Result<Option<Blueprint>, SchemaError> {
        let mut dir = match tokio::fs::read_dir(&self.directory).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(directory = %self.directory.display(), "blueprint directory missing");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if blueprint_format(&path).is_some() {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let raw = match tokio::fs::read_to_string(&path).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable blueprint");
                    continue;
                }
            };
            match parse_blueprint(&path, &raw) {
                Ok(bp) if bp.reference == reference => return Ok(Some(bp)),
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping malformed blueprint"),
            }
        }
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlueprintFormat {
    Json,
    Yaml,
}

fn blueprint_format(path: &Path) -> Option<BlueprintFormat> {
    match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
        "json" => Some(BlueprintFormat::Json),
        "yaml" | "yml" => Some(BlueprintFormat::Yaml),
        _ => None,
    }
}

fn parse_blueprint(path: &Path, raw: &str) -> anyhow::Result<Blueprint> {
    Ok(match blueprint_format(path) {
        Some(BlueprintFormat::Yaml) => serde_yaml::from_str(raw)?,
        _ => serde_json::from_str(raw)?,
    })
}

/// Outcome of reconciling configured devices against registered tables
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub created: Vec<String>,
    pub existing: Vec<String>,
    pub failed: Vec<ReconcileFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileFailure {
    pub device: String,
    pub reason: String,
}

pub struct SchemaRegistry {
    catalog: BlueprintCatalog,
    store: Arc<dyn TelemetryStore>,
}

impl SchemaRegistry {
    pub fn new(catalog: BlueprintCatalog, store: Arc<dyn TelemetryStore>) -> Self {
        Self { catalog, store }
    }

    pub fn catalog(&self) -> &BlueprintCatalog {
        &self.catalog
    }

    /// Provision the device's table; returns the table name
    ///
    /// Idempotent: an already registered device keeps its table and columns, and
    /// no blueprint lookup happens.
    pub async fn create_table(&self, device_name: &str, reference: &str) -> Result<String, SchemaError> {
        if let Some(existing) = self.store.device_table(device_name) {
            debug!(device = device_name, table = %existing.table_name, "device table already registered");
            return Ok(existing.table_name);
        }

        let schema = self.catalog.lookup(reference).await?;
        let table = self.store.ensure_device_table(device_name, &schema).await?;
        info!(
            device = device_name,
            reference,
            table = %table.table_name,
            columns = table.columns.len(),
            "device table ready"
        );
        Ok(table.table_name)
    }

    /// Drop the device's table and registry row; false if none existed
    pub async fn delete_table(&self, device_name: &str) -> Result<bool, SchemaError> {
        let dropped = self.store.drop_device_table(device_name).await?;
        if dropped {
            info!(device = device_name, "device table dropped");
        }
        Ok(dropped)
    }

    /// Make sure every configured device has a table
    ///
    /// A failing device is reported and does not stop the others.
    pub async fn reconcile(&self, devices: &[DeviceConfig]) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for device in devices {
            if self.store.device_table(&device.name).is_some() {
                report.existing.push(device.name.clone());
                continue;
            }
            match self.create_table(&device.name, &device.reference).await {
                Ok(_) => report.created.push(device.name.clone()),
                Err(e) => {
                    warn!(device = %device.name, reference = %device.reference, error = %e, "could not provision device table");
                    report.failed.push(ReconcileFailure {
                        device: device.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            created = report.created.len(),
            existing = report.existing.len(),
            failed = report.failed.len(),
            "device tables reconciled"
        );
        report
    }
}
