use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::DeviceCategory;

/// Round to two decimals, half-up
pub fn round2(value: f64) -> f64 {
    let rounded = ((value * 100.0) + 0.5).floor() / 100.0;
    // Normalise -0.0 so payloads never carry a signed zero
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

/// Which categories had at least one device reporting in a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshCategories {
    pub solar: bool,
    pub grid: bool,
    pub genset: bool,
}

impl FreshCategories {
    pub fn mark(&mut self, category: DeviceCategory) {
        match category {
            DeviceCategory::Solar => self.solar = true,
            DeviceCategory::Grid => self.grid = true,
            DeviceCategory::Genset => self.genset = true,
        }
    }

    pub fn contains(&self, category: DeviceCategory) -> bool {
        match category {
            DeviceCategory::Solar => self.solar,
            DeviceCategory::Grid => self.grid,
            DeviceCategory::Genset => self.genset,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.solar || self.grid || self.genset)
    }
}

/// Power-flow totals derived from one batch
///
/// Balance: load = solar + grid + genset (grid is negative when exporting)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSnapshot {
    pub solar: f64,
    pub grid: f64,
    pub genset: f64,
    pub load: f64,
    pub received_devices: FreshCategories,
    pub timestamp: DateTime<Utc>,
}

impl AggregateSnapshot {
    /// Build a snapshot from raw category totals; rounds every metric
    pub fn new(
        solar: f64,
        grid: f64,
        genset: f64,
        received_devices: FreshCategories,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let solar = round2(solar);
        let grid = round2(grid);
        let genset = round2(genset);
        Self {
            solar,
            grid,
            genset,
            load: round2(solar + grid + genset),
            received_devices,
            timestamp,
        }
    }

    pub fn status(&self) -> FlowStatus {
        FlowStatus::from_snapshot(self)
    }
}

impl fmt::Display for AggregateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AggregateSnapshot {{ Solar: {:.2}W, Grid: {:.2}W, Genset: {:.2}W, Load: {:.2}W }}",
            self.solar, self.grid, self.genset, self.load
        )
    }
}

/// Human readable per-category state, derived only from the sign of each metric
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowStatus {
    pub solar: &'static str,
    pub grid: &'static str,
    pub genset: &'static str,
    pub load: &'static str,
}

impl FlowStatus {
    pub fn from_snapshot(snapshot: &AggregateSnapshot) -> Self {
        Self {
            solar: if snapshot.solar > 0.0 { "Active" } else { "Inactive" },
            grid: if snapshot.grid > 0.0 { "Active" } else { "Inactive" },
            genset: if snapshot.genset > 0.0 { "Running" } else { "Stopped" },
            load: if snapshot.load > 0.0 { "Active" } else { "No Load" },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn snapshot(solar: f64, grid: f64, genset: f64) -> AggregateSnapshot {
        AggregateSnapshot::new(solar, grid, genset, FreshCategories::default(), Utc::now())
    }

    #[rstest]
    #[case(1.234, 1.23)]
    #[case(1.236, 1.24)]
    #[case(2.125, 2.13)]
    #[case(-2.125, -2.12)]
    #[case(2.5, 2.5)]
    #[case(-1.234, -1.23)]
    #[case(-1.236, -1.24)]
    #[case(-0.001, 0.0)]
    #[case(100.0, 100.0)]
    fn test_round2(#[case] input: f64, #[case] expected: f64) {
        assert_eq!(round2(input), expected);
    }

    #[test]
    fn test_load_is_sum_of_sources() {
        let s = snapshot(250.0, -50.0, 75.0);
        assert_eq!(s.load, 275.0);
    }

    #[test]
    fn test_status_labels() {
        let status = snapshot(250.0, -50.0, 0.0).status();
        assert_eq!(status.solar, "Active");
        assert_eq!(status.grid, "Inactive");
        assert_eq!(status.genset, "Stopped");
        assert_eq!(status.load, "Active");

        let idle = snapshot(0.0, 0.0, 0.0).status();
        assert_eq!(idle.load, "No Load");

        let genset_only = snapshot(0.0, 0.0, 12.0).status();
        assert_eq!(genset_only.genset, "Running");
    }

    #[test]
    fn test_serializes_camel_case() {
        let mut fresh = FreshCategories::default();
        fresh.mark(DeviceCategory::Solar);
        let s = AggregateSnapshot::new(1.0, 2.0, 3.0, fresh, Utc::now());
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["receivedDevices"]["solar"], true);
        assert_eq!(json["receivedDevices"]["grid"], false);
        assert_eq!(json["load"], 6.0);
    }

    #[test]
    fn test_display() {
        let display = format!("{}", snapshot(5.0, 3.0, 1.0));
        assert!(display.contains("Solar: 5.00W"));
        assert!(display.contains("Load: 9.00W"));
    }
}
