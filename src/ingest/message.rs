//! Wire format of inbound bus messages

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::domain::{DeviceReading, RegisterMap};

/// One bus message; entries are kept raw so a bad one cannot sink the batch
#[derive(Debug, Clone, Deserialize)]
pub struct BusMessage {
    #[serde(default)]
    pub data: Vec<serde_json::Value>,
    #[serde(default)]
    pub metadata: BatchMetadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchMetadata {
    #[serde(default, alias = "batchId")]
    pub batch_id: Option<String>,
    /// Epoch milliseconds, as a number or a numeric string
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
}

impl BatchMetadata {
    pub fn batch_id_or_generate(&self) -> String {
        match self.batch_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        }
    }

    pub fn timestamp_or(&self, fallback: DateTime<Utc>) -> DateTime<Utc> {
        self.timestamp
            .as_ref()
            .and_then(parse_epoch_ms)
            .unwrap_or(fallback)
    }
}

fn parse_epoch_ms(raw: &serde_json::Value) -> Option<DateTime<Utc>> {
    let millis = match raw {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        serde_json::Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))?
        }
        _ => return None,
    };
    DateTime::from_timestamp_millis(millis)
}

#[derive(Debug, Clone, Deserialize)]
struct RawEntry {
    #[serde(rename = "deviceMetaData", alias = "deviceMetadata")]
    device: Option<RawDeviceMeta>,
    #[serde(alias = "registers")]
    register: Option<RegisterMap>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawDeviceMeta {
    #[serde(alias = "deviceName", alias = "name")]
    device_name: Option<String>,
    #[serde(default, alias = "deviceType", alias = "type")]
    device_type: Option<String>,
    #[serde(default)]
    reference: Option<String>,
}

/// Readings extracted from one message
#[derive(Debug, Clone)]
pub struct DecodedBatch {
    pub batch_id: String,
    pub timestamp: DateTime<Utc>,
    pub readings: Vec<DeviceReading>,
    pub skipped: usize,
}

/// Turn a message into readings, skipping entries without a name or registers
pub fn decode_batch(message: &BusMessage, received_at: DateTime<Utc>) -> DecodedBatch {
    let batch_id = message.metadata.batch_id_or_generate();
    let timestamp = message.metadata.timestamp_or(received_at);

    let mut readings = Vec::with_capacity(message.data.len());
    let mut skipped = 0;

    for (index, raw) in message.data.iter().enumerate() {
        match decode_entry(raw, &batch_id, timestamp) {
            Ok(reading) => readings.push(reading),
            Err(reason) => {
                skipped += 1;
                warn!(batch_id = %batch_id, entry = index, reason, "skipping malformed entry");
            }
        }
    }

    DecodedBatch {
        batch_id,
        timestamp,
        readings,
        skipped,
    }
}

fn decode_entry(
    raw: &serde_json::Value,
    batch_id: &str,
    timestamp: DateTime<Utc>,
) -> Result<DeviceReading, &'static str> {
    let entry = RawEntry::deserialize(raw).map_err(|_| "entry is not a device record")?;
    let meta = entry.device.ok_or("missing device metadata")?;
    let device_name = meta
        .device_name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .ok_or("missing device name")?;
    let registers = entry.register.ok_or("missing register map")?;

    Ok(DeviceReading {
        device_name,
        device_type: meta.device_type.unwrap_or_default(),
        reference: meta.reference,
        registers,
        batch_id: batch_id.to_string(),
        timestamp,
    })
}
