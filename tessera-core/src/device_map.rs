use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Where to place the model: `cpu`, or an accelerator ordinal (`0`, `gpu:1`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

impl fmt::Display for DeviceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceMap::ForceCpu => write!(f, "cpu"),
            DeviceMap::Ordinal(ordinal) => write!(f, "gpu:{ordinal}"),
        }
    }
}

impl FromStr for DeviceMap {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "cpu" {
            return Ok(DeviceMap::ForceCpu);
        }
        let ordinal = s
            .strip_prefix("gpu:")
            .or_else(|| s.strip_prefix("cuda:"))
            .or_else(|| s.strip_prefix("metal:"))
            .unwrap_or(&s);
        ordinal
            .parse()
            .map(DeviceMap::Ordinal)
            .map_err(|_| format!("invalid device `{s}`, expected `cpu` or a device ordinal"))
    }
}

impl TryFrom<String> for DeviceMap {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceMap> for String {
    fn from(value: DeviceMap) -> Self {
        value.to_string()
    }
}
