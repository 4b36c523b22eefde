use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use strum::{Display, EnumIter, EnumString};

/// Power-flow category a device feeds into
///
/// `load` is not a device category: it is derived from the other three.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    Display, EnumString, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeviceCategory {
    Solar,
    Grid,
    Genset,
}

impl DeviceCategory {
    /// Classify a free-form `device_type` string
    pub fn classify(device_type: &str) -> Option<Self> {
        let t = device_type.to_ascii_lowercase();
        if t.contains("solar") || t.contains("inverter") || t.contains("pv") {
            Some(Self::Solar)
        } else if t.contains("gen") {
            Some(Self::Genset)
        } else if t.contains("grid") || t.contains("meter") {
            Some(Self::Grid)
        } else {
            None
        }
    }
}

/// A device as declared in the devices YAML file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub device_type: String,
    pub reference: String,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DeviceFile {
    #[serde(default)]
    devices: Vec<DeviceConfig>,
}

/// Read the configured device list
///
/// A missing file is treated as an empty device list so a fresh install can
/// start before any device has been added.
pub fn load_devices(path: &Path) -> Result<Vec<DeviceConfig>> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "devices file not found, starting with no devices");
        return Ok(Vec::new());
    }

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read devices file {}", path.display()))?;
    parse_devices(&raw).with_context(|| format!("failed to parse devices file {}", path.display()))
}

pub fn parse_devices(raw: &str) -> Result<Vec<DeviceConfig>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let file: DeviceFile = serde_yaml::from_str(raw)?;
    Ok(file.devices)
}
