use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use tracing::debug;

use super::{AggregateSnapshot, FreshCategories};
use crate::domain::{DeviceCategory, DeviceReading};

/// Last known total per category
///
/// Lives only in memory: a restart starts every category from zero again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateState {
    pub solar: f64,
    pub grid: f64,
    pub genset: f64,
}

/// Result of folding one batch into the state
#[derive(Debug, Clone, PartialEq)]
pub struct BatchAggregate {
    pub snapshot: AggregateSnapshot,
    pub fresh: FreshCategories,
    /// Devices whose power was resolved and counted
    pub contributing_devices: usize,
}

impl AggregateState {
    fn slot(&mut self, category: DeviceCategory) -> &mut f64 {
        match category {
            DeviceCategory::Solar => &mut self.solar,
            DeviceCategory::Grid => &mut self.grid,
            DeviceCategory::Genset => &mut self.genset,
        }
    }

    pub fn get(&self, category: DeviceCategory) -> f64 {
        match category {
            DeviceCategory::Solar => self.solar,
            DeviceCategory::Grid => self.grid,
            DeviceCategory::Genset => self.genset,
        }
    }

    /// Fold one batch of readings into the state
    ///
    /// Carry-forward works per category: a category with at least one device
    /// reporting power is replaced by the fresh sum of those devices, a category
    /// with none keeps its previous total.
    pub fn apply(&mut self, readings: &[DeviceReading], timestamp: DateTime<Utc>) -> BatchAggregate {
        let mut sums = AggregateState::default();
        let mut fresh = FreshCategories::default();
        let mut contributing_devices = 0;

        for reading in readings {
            let Some(category) = DeviceCategory::classify(&reading.device_type) else {
                continue;
            };
            let Some(power) = reading.active_power() else {
                debug!(device = %reading.device_name, "no power registers in reading");
                continue;
            };
            *sums.slot(category) += power;
            fresh.mark(category);
            contributing_devices += 1;
        }

        for category in DeviceCategory::iter() {
            if fresh.contains(category) {
                *self.slot(category) = sums.get(category);
            }
        }

        BatchAggregate {
            snapshot: AggregateSnapshot::new(self.solar, self.grid, self.genset, fresh, timestamp),
            fresh,
            contributing_devices,
        }
    }
}

/// Owns the carry-forward state and serializes batches through one lock
#[derive(Debug, Default)]
pub struct AggregationEngine {
    state: Mutex<AggregateState>,
}

impl AggregationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: AggregateState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn apply(&self, readings: &[DeviceReading], timestamp: DateTime<Utc>) -> BatchAggregate {
        self.state.lock().apply(readings, timestamp)
    }

    pub fn state(&self) -> AggregateState {
        *self.state.lock()
    }

    pub fn reset(&self) {
        *self.state.lock() = AggregateState::default();
    }
}
