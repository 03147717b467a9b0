//! Hardware description catalog.
//!
//! Each subsystem ships a hardware description directory holding a
//! `devices.yaml` (bus devices) and a `thermal.yaml` (thermal policy and
//! temperature sensors with their alarm and fan thresholds). The catalog
//! loads those files per subsystem and hands out immutable descriptors.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, bail};
use log::debug;
use serde::{Deserialize, Serialize};

/// Alarm thresholds in degrees Celsius.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmThresholds {
    pub emergency_on: f64,
    pub emergency_off: f64,
    pub critical_on: f64,
    pub critical_off: f64,
    pub max_on: f64,
    pub max_off: f64,
    pub min: f64,
    pub low_crit: f64,
}

/// Fan speed request thresholds in degrees Celsius.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanThresholds {
    pub max_on: f64,
    pub max_off: f64,
    pub fast_on: f64,
    pub fast_off: f64,
    pub medium_on: f64,
    pub medium_off: f64,
}

/// Catalog entry for a single temperature sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDescriptor {
    /// Sensor number, unique within its subsystem.
    pub number: u32,
    /// Human readable placement of the sensor on the board.
    pub location: String,
    /// Name of the bus device in `devices.yaml`.
    pub device: String,
    /// Transducer type, e.g. `lm75`.
    #[serde(rename = "type")]
    pub kind: String,
    pub alarm_thresholds: AlarmThresholds,
    pub fan_thresholds: FanThresholds,
}

/// Bus device the transducer talks to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub name: String,
    /// i2c adapter number (`/dev/i2c-<bus>`).
    pub bus: u32,
    /// 7-bit slave address.
    pub address: u16,
    /// Register holding the temperature value.
    #[serde(default)]
    pub register: u8,
}

/// Subsystem-wide thermal policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThermalPolicy {
    /// Power the box off when a sensor stays in emergency.
    #[serde(default)]
    pub auto_shutdown: bool,
    /// Polling period advertised by the hardware description, in seconds.
    #[serde(default)]
    pub polling_period: Option<u32>,
}

/// Source of device and sensor topology per subsystem.
pub trait HardwareCatalog: Send + Sync {
    /// Loads (or reloads) the hardware description of `subsystem` from `dir`.
    fn load(&mut self, subsystem: &str, dir: &Path) -> Result<()>;

    /// Number of temperature sensors in a loaded subsystem (0 if unknown).
    fn sensor_count(&self, subsystem: &str) -> usize;

    fn sensor_descriptor(&self, subsystem: &str, index: usize) -> Option<Arc<SensorDescriptor>>;

    fn thermal_policy(&self, subsystem: &str) -> Option<ThermalPolicy>;

    fn device(&self, subsystem: &str, name: &str) -> Option<Arc<DeviceDescriptor>>;

    /// Drops everything known about `subsystem`.
    fn unload(&mut self, subsystem: &str);
}

#[derive(Debug, Deserialize)]
struct DevicesFile {
    #[serde(default)]
    devices: Vec<DeviceDescriptor>,
}

#[derive(Debug, Deserialize)]
struct ThermalFile {
    info: ThermalPolicy,
    #[serde(default)]
    sensors: Vec<SensorDescriptor>,
}

#[derive(Debug, Default)]
struct SubsystemDescription {
    policy: Option<ThermalPolicy>,
    devices: HashMap<String, Arc<DeviceDescriptor>>,
    sensors: Vec<Arc<SensorDescriptor>>,
}

/// Catalog reading `devices.yaml` and `thermal.yaml` from each subsystem's
/// hardware description directory.
#[derive(Debug, Default)]
pub struct YamlCatalog {
    subsystems: HashMap<String, SubsystemDescription>,
}

impl YamlCatalog {
    pub const DEVICES_FILE: &'static str = "devices.yaml";
    pub const THERMAL_FILE: &'static str = "thermal.yaml";

    pub fn new() -> Self {
        Self::default()
    }

    fn read_file(dir: &Path, name: &str) -> Result<(PathBuf, String)> {
        let path = dir.join(name);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read h/w description {}", path.display()))?;
        Ok((path, content))
    }
}

impl HardwareCatalog for YamlCatalog {
    fn load(&mut self, subsystem: &str, dir: &Path) -> Result<()> {
        if dir.as_os_str().is_empty() {
            bail!("No h/w description directory for subsystem {subsystem}");
        }

        let (devices_path, devices_yaml) = Self::read_file(dir, Self::DEVICES_FILE)?;
        let (thermal_path, thermal_yaml) = Self::read_file(dir, Self::THERMAL_FILE)?;

        let devices: DevicesFile = serde_yaml::from_str(&devices_yaml).with_context(|| {
            format!(
                "Unable to parse subsystem {subsystem} devices file ({})",
                devices_path.display()
            )
        })?;
        let thermal: ThermalFile = serde_yaml::from_str(&thermal_yaml).with_context(|| {
            format!(
                "Unable to parse subsystem {subsystem} thermal file ({})",
                thermal_path.display()
            )
        })?;

        debug!(
            "Loaded h/w description for {subsystem}: {} devices, {} sensors",
            devices.devices.len(),
            thermal.sensors.len()
        );

        self.subsystems.insert(
            subsystem.to_string(),
            SubsystemDescription {
                policy: Some(thermal.info),
                devices: devices
                    .devices
                    .into_iter()
                    .map(|d| (d.name.clone(), Arc::new(d)))
                    .collect(),
                sensors: thermal.sensors.into_iter().map(Arc::new).collect(),
            },
        );

        Ok(())
    }

    fn sensor_count(&self, subsystem: &str) -> usize {
        self.subsystems
            .get(subsystem)
            .map_or(0, |desc| desc.sensors.len())
    }

    fn sensor_descriptor(&self, subsystem: &str, index: usize) -> Option<Arc<SensorDescriptor>> {
        self.subsystems
            .get(subsystem)
            .and_then(|desc| desc.sensors.get(index).cloned())
    }

    fn thermal_policy(&self, subsystem: &str) -> Option<ThermalPolicy> {
        self.subsystems.get(subsystem).and_then(|desc| desc.policy)
    }

    fn device(&self, subsystem: &str, name: &str) -> Option<Arc<DeviceDescriptor>> {
        self.subsystems
            .get(subsystem)
            .and_then(|desc| desc.devices.get(name).cloned())
    }

    fn unload(&mut self, subsystem: &str) {
        self.subsystems.remove(subsystem);
    }
}
