//! In-memory model of subsystems and their temperature sensors.

use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::catalog::{DeviceDescriptor, SensorDescriptor};

/// Temperatures are kept in milli-degrees Celsius.
pub const MILLI_DEGREES: i32 = 1000;

/// Initial low-water mark, above any plausible reading.
const INITIAL_MIN: i32 = 1_000_000;
/// Initial high-water mark, below any plausible reading.
const INITIAL_MAX: i32 = -1_000_000;

/// Alarm status of a sensor. The string forms are shared with the state
/// store and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorStatus {
    Uninitialized,
    Normal,
    Min,
    Max,
    #[serde(rename = "low_critical")]
    LowCrit,
    Critical,
    #[serde(rename = "fault")]
    Failed,
    Emergency,
}

impl SensorStatus {
    pub const ALL: [SensorStatus; 8] = [
        SensorStatus::Uninitialized,
        SensorStatus::Normal,
        SensorStatus::Min,
        SensorStatus::Max,
        SensorStatus::LowCrit,
        SensorStatus::Critical,
        SensorStatus::Failed,
        SensorStatus::Emergency,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            SensorStatus::Uninitialized => "uninitialized",
            SensorStatus::Normal => "normal",
            SensorStatus::Min => "min",
            SensorStatus::Max => "max",
            SensorStatus::LowCrit => "low_critical",
            SensorStatus::Critical => "critical",
            SensorStatus::Failed => "fault",
            SensorStatus::Emergency => "emergency",
        }
    }
}

impl fmt::Display for SensorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow!("unknown sensor status '{s}'"))
    }
}

/// Requested fan speed, ordered from slowest to fastest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanSpeed {
    Normal,
    Medium,
    Fast,
    Max,
}

impl FanSpeed {
    pub const ALL: [FanSpeed; 4] = [
        FanSpeed::Normal,
        FanSpeed::Medium,
        FanSpeed::Fast,
        FanSpeed::Max,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            FanSpeed::Normal => "normal",
            FanSpeed::Medium => "medium",
            FanSpeed::Fast => "fast",
            FanSpeed::Max => "max",
        }
    }
}

impl fmt::Display for FanSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FanSpeed {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|speed| speed.as_str() == s)
            .ok_or_else(|| anyhow!("unknown fan state '{s}'"))
    }
}

/// The part of a sensor the threshold engine works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThermalState {
    pub status: SensorStatus,
    pub fan_speed: FanSpeed,
    pub min: i32,
    pub max: i32,
}

/// One physical temperature sensor.
///
/// `subsystem` is the registry key of the owning subsystem, never a
/// pointer; sensors only go away together with their subsystem.
#[derive(Debug, Clone)]
pub struct Sensor {
    pub name: String,
    pub subsystem: String,
    pub descriptor: Arc<SensorDescriptor>,
    /// Bus device resolved from the catalog at creation time.
    pub device: Option<Arc<DeviceDescriptor>>,
    pub status: SensorStatus,
    pub fan_speed: FanSpeed,
    pub temp: i32,
    pub min: i32,
    pub max: i32,
    pub fault_count: u32,
    pub test_temp: Option<i32>,
}

impl Sensor {
    /// Builds the process-wide sensor name `{subsystem}-{number}`.
    pub fn make_name(subsystem: &str, number: u32) -> String {
        format!("{subsystem}-{number}")
    }

    pub fn new(
        subsystem: &str,
        descriptor: Arc<SensorDescriptor>,
        device: Option<Arc<DeviceDescriptor>>,
    ) -> Self {
        Self {
            name: Self::make_name(subsystem, descriptor.number),
            subsystem: subsystem.to_string(),
            descriptor,
            device,
            status: SensorStatus::Uninitialized,
            fan_speed: FanSpeed::Normal,
            temp: 0,
            min: INITIAL_MIN,
            max: INITIAL_MAX,
            fault_count: 0,
            test_temp: None,
        }
    }

    pub fn thermal_state(&self) -> ThermalState {
        ThermalState {
            status: self.status,
            fan_speed: self.fan_speed,
            min: self.min,
            max: self.max,
        }
    }

    pub fn apply(&mut self, state: ThermalState) {
        self.status = state.status;
        self.fan_speed = state.fan_speed;
        self.min = state.min;
        self.max = state.max;
    }
}

/// A hardware module grouping temperature sensors under one shutdown policy.
#[derive(Debug, Clone)]
pub struct Subsystem {
    pub name: String,
    pub valid: bool,
    /// Set while a reconciliation pass has seen this subsystem.
    pub marked: bool,
    /// Reserved for nested subsystems; never populated.
    pub parent: Option<String>,
    pub sensors: BTreeMap<String, Sensor>,
    pub auto_shutdown: bool,
}

impl Subsystem {
    pub fn new(name: &str, auto_shutdown: bool) -> Self {
        Self {
            name: name.to_string(),
            valid: false,
            marked: false,
            parent: None,
            sensors: BTreeMap::new(),
            auto_shutdown,
        }
    }
}
