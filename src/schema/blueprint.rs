use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A protocol blueprint document as found on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub reference: String,
    #[serde(default)]
    pub header: BlueprintHeader,
    #[serde(default, alias = "data")]
    pub registers: Vec<RegisterSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlueprintHeader {
    #[serde(default, rename = "type", alias = "device_type")]
    pub device_type: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterSpec {
    #[serde(rename = "shortName", alias = "short_name")]
    pub short_name: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
}

/// Register name -> SQL column mapping
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub register: String,
    pub column: String,
}

/// Column layout of one device's time series table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSchema {
    pub reference: String,
    pub device_type: Option<String>,
    pub columns: Vec<ColumnDescriptor>,
}

/// Columns every device table carries besides its registers
pub const RESERVED_COLUMNS: [&str; 2] = ["timestamp", "sample_count"];

impl DeviceSchema {
    /// Derive the column layout; register order is preserved and duplicates dropped
    pub fn from_blueprint(blueprint: &Blueprint) -> Self {
        let mut seen_registers = HashSet::new();
        let mut used_columns: HashSet<String> =
            RESERVED_COLUMNS.iter().map(|c| c.to_string()).collect();
        let mut columns = Vec::with_capacity(blueprint.registers.len());

        for spec in &blueprint.registers {
            let register = spec.short_name.trim();
            if register.is_empty() || !seen_registers.insert(register.to_string()) {
                continue;
            }

            let base = sanitize_identifier(register);
            let mut column = base.clone();
            let mut n = 2;
            while !used_columns.insert(column.to_ascii_lowercase()) {
                column = format!("{}_{}", base, n);
                n += 1;
            }

            columns.push(ColumnDescriptor {
                register: register.to_string(),
                column,
            });
        }

        Self {
            reference: blueprint.reference.clone(),
            device_type: blueprint.header.device_type.clone(),
            columns,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn registers(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.register.as_str())
    }
}

/// Reduce an arbitrary name to `[A-Za-z0-9_]`, never starting with a digit
pub fn sanitize_identifier(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert_str(0, "r_");
    }
    out
}
