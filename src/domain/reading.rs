use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Composite active power register
pub const REGISTER_TOTAL_POWER: &str = "W";

/// Per-phase active power registers
pub const REGISTER_PHASES: [&str; 3] = ["WphA", "WphB", "WphC"];

/// A single register value as reported by a device
///
/// Devices report numbers, numeric strings, JSON `null` or the literal string
/// `"null"`. All of those collapse into an explicit optional number so that a
/// missing value is never silently read as zero.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RegisterValue(pub Option<f64>);

impl RegisterValue {
    pub const NULL: RegisterValue = RegisterValue(None);

    pub fn new(value: f64) -> Self {
        Self(Some(value))
    }

    pub fn value(&self) -> Option<f64> {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0.is_none()
    }

    /// Interpret a raw JSON value coming off the bus
    pub fn from_json(raw: &serde_json::Value) -> Self {
        use serde_json::Value;

        let parsed = match raw {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
                    None
                } else {
                    trimmed.parse::<f64>().ok()
                }
            }
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        };

        Self(parsed.filter(|v| v.is_finite()))
    }
}

impl From<f64> for RegisterValue {
    fn from(value: f64) -> Self {
        Self::new(value)
    }
}

impl From<Option<f64>> for RegisterValue {
    fn from(value: Option<f64>) -> Self {
        Self(value)
    }
}

impl<'de> Deserialize<'de> for RegisterValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Ok(Self::from_json(&raw))
    }
}

impl Serialize for RegisterValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self.0 {
            Some(v) => serializer.serialize_f64(v),
            None => serializer.serialize_none(),
        }
    }
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(v) => write!(f, "{}", v),
            None => write!(f, "null"),
        }
    }
}

/// Register short name -> value, ordered for stable payloads
pub type RegisterMap = BTreeMap<String, RegisterValue>;

/// One device's contribution to an ingested batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceReading {
    pub device_name: String,
    pub device_type: String,
    pub reference: Option<String>,
    pub registers: RegisterMap,
    pub batch_id: String,
    pub timestamp: DateTime<Utc>,
}

impl DeviceReading {
    /// Resolve the active power this device reports for the batch
    ///
    /// `W` wins when it carries a value. Otherwise all three phase registers must
    /// be present and the non-null ones are summed; if every phase is null the
    /// device reported nothing. `None` means the device did
    /// not contribute power data, which is different from contributing zero.
    pub fn active_power(&self) -> Option<f64> {
        if let Some(total) = self
            .registers
            .get(REGISTER_TOTAL_POWER)
            .and_then(RegisterValue::value)
        {
            return Some(total);
        }

        if REGISTER_PHASES
            .iter()
            .all(|phase| self.registers.contains_key(*phase))
        {
            let mut phases = REGISTER_PHASES
                .iter()
                .filter_map(|phase| self.registers.get(*phase).and_then(RegisterValue::value))
                .peekable();
            phases.peek()?;
            return Some(phases.sum());
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn reading(registers: serde_json::Value) -> DeviceReading {
        DeviceReading {
            device_name: "Inv1".to_string(),
            device_type: "solar_inverter".to_string(),
            reference: None,
            registers: serde_json::from_value(registers).unwrap(),
            batch_id: "b1".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[rstest]
    #[case(json!(12.5), Some(12.5))]
    #[case(json!("42"), Some(42.0))]
    #[case(json!(" -3.25 "), Some(-3.25))]
    #[case(json!("null"), None)]
    #[case(json!("NULL"), None)]
    #[case(json!(null), None)]
    #[case(json!("abc"), None)]
    #[case(json!(""), None)]
    #[case(json!([1, 2]), None)]
    fn test_register_value_parsing(#[case] raw: serde_json::Value, #[case] expected: Option<f64>) {
        assert_eq!(RegisterValue::from_json(&raw).value(), expected);
    }

    #[test]
    fn test_register_value_serializes_null_as_json_null() {
        let map: RegisterMap = [
            ("W".to_string(), RegisterValue::NULL),
            ("V".to_string(), RegisterValue::new(230.0)),
        ]
        .into_iter()
        .collect();
        let json = serde_json::to_value(&map).unwrap();
        assert_eq!(json, json!({"V": 230.0, "W": null}));
    }

    #[test]
    fn test_active_power_prefers_composite() {
        let r = reading(json!({"W": 250, "WphA": 1, "WphB": 1, "WphC": 1}));
        assert_eq!(r.active_power(), Some(250.0));
    }

    #[test]
    fn test_active_power_null_composite_falls_back_to_phases() {
        let r = reading(json!({"W": "null", "WphA": "10", "WphB": "10", "WphC": "10"}));
        assert_eq!(r.active_power(), Some(30.0));
    }

    #[test]
    fn test_active_power_skips_null_phases() {
        let r = reading(json!({"WphA": 5, "WphB": null, "WphC": "7"}));
        assert_eq!(r.active_power(), Some(12.0));
    }

    #[test]
    fn test_active_power_missing_phase_means_no_data() {
        let r = reading(json!({"WphA": 5, "WphB": 5}));
        assert_eq!(r.active_power(), None);

        let r = reading(json!({"W": "null", "V": 230}));
        assert_eq!(r.active_power(), None);
    }

    #[test]
    fn test_active_power_all_null_means_no_data() {
        let r = reading(json!({"W": "null", "WphA": "null", "WphB": null, "WphC": "null"}));
        assert_eq!(r.active_power(), None);
    }
}
