//! Final hand-off of device and aggregate payloads to subscribed clients

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

use crate::domain::{DeviceReading, RegisterValue};
use crate::power_flow::{AggregateSnapshot, FlowStatus, FreshCategories};
use crate::subscriptions::{RoomKey, SubscriptionRegistry};

pub const DEVICE_EVENT: &str = "sensor-data";
pub const AGGREGATE_EVENT: &str = "power-flow";

/// Keys the gateway adds to every device payload
pub const RESERVED_KEYS: [&str; 2] = ["_timestamp", "_deviceName"];

/// Raw register map of one device, tagged with receive time and name
#[derive(Debug, Clone, Serialize)]
pub struct DevicePayload<'a> {
    #[serde(flatten)]
    pub registers: BTreeMap<&'a str, &'a RegisterValue>,
    #[serde(rename = "_timestamp")]
    pub timestamp: i64,
    #[serde(rename = "_deviceName")]
    pub device_name: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatePayload {
    pub solar: f64,
    pub grid: f64,
    pub genset: f64,
    pub load: f64,
    pub timestamp: i64,
    pub received_devices: FreshCategories,
    pub status: FlowStatus,
}

impl From<&AggregateSnapshot> for AggregatePayload {
    fn from(s: &AggregateSnapshot) -> Self {
        Self {
            solar: s.solar,
            grid: s.grid,
            genset: s.genset,
            load: s.load,
            timestamp: s.timestamp.timestamp_millis(),
            received_devices: s.received_devices,
            status: s.status(),
        }
    }
}

#[derive(Clone)]
pub struct BroadcastGateway {
    subscriptions: Arc<SubscriptionRegistry>,
}

impl BroadcastGateway {
    pub fn new(subscriptions: Arc<SubscriptionRegistry>) -> Self {
        Self { subscriptions }
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    /// Push one device's registers to `sensor:<name>`; false if nobody listens
    pub fn push_device(&self, reading: &DeviceReading, received_at: DateTime<Utc>) -> bool {
        let payload = DevicePayload {
            registers: reading
                .registers
                .iter()
                .filter(|(name, _)| !RESERVED_KEYS.contains(&name.as_str()))
                .map(|(name, value)| (name.as_str(), value))
                .collect(),
            timestamp: received_at.timestamp_millis(),
            device_name: &reading.device_name,
        };
        let sent = self
            .subscriptions
            .emit(&RoomKey::device(&reading.device_name), DEVICE_EVENT, &payload);
        trace!(device = %reading.device_name, sent, "device push");
        sent
    }

    /// Push an aggregate snapshot to `power-flow`; false if nobody listens
    pub fn push_aggregate(&self, snapshot: &AggregateSnapshot) -> bool {
        self.subscriptions.emit(
            &RoomKey::PowerFlow,
            AGGREGATE_EVENT,
            &AggregatePayload::from(snapshot),
        )
    }
}
