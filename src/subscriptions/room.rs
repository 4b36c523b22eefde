use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub const POWER_FLOW_ROOM: &str = "power-flow";
const DEVICE_ROOM_PREFIX: &str = "sensor:";

/// Broadcast room a client can join
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoomKey {
    /// `sensor:<device_name>` - raw readings of one device
    Device(String),
    /// `power-flow` - aggregate snapshots
    PowerFlow,
}

impl RoomKey {
    pub fn device(name: impl Into<String>) -> Self {
        Self::Device(name.into())
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomKey::Device(name) => write!(f, "{}{}", DEVICE_ROOM_PREFIX, name),
            RoomKey::PowerFlow => f.write_str(POWER_FLOW_ROOM),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown room: {0}")]
pub struct UnknownRoom(pub String);

impl FromStr for RoomKey {
    type Err = UnknownRoom;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == POWER_FLOW_ROOM {
            return Ok(RoomKey::PowerFlow);
        }
        match s.strip_prefix(DEVICE_ROOM_PREFIX) {
            Some(name) if !name.is_empty() => Ok(RoomKey::Device(name.to_string())),
            _ => Err(UnknownRoom(s.to_string())),
        }
    }
}

impl Serialize for RoomKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RoomKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
