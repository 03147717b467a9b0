//! Subsystem and sensor lifecycle.
//!
//! The registry is the single owner of every [`Subsystem`] and, through
//! them, every [`Sensor`]. Subsystems come and go only through
//! [`SubsystemRegistry::reconcile`], which marks what the store still lists
//! and sweeps the rest. Sensors are created with their subsystem and die
//! with it; the global name index is kept in step with both.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::Path,
};

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, error, info};

use crate::{
    catalog::HardwareCatalog,
    model::{MILLI_DEGREES, Sensor, Subsystem},
    reader::SensorReader,
    store::SubsystemRow,
};

/// Subsystems created and destroyed by one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: Vec<String>,
    pub removed: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct SubsystemRegistry {
    subsystems: BTreeMap<String, Subsystem>,
    /// Global sensor index: sensor name to owning subsystem name.
    sensors: HashMap<String, String>,
}

impl SubsystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subsystem(&self, name: &str) -> Option<&Subsystem> {
        self.subsystems.get(name)
    }

    pub fn subsystems(&self) -> impl Iterator<Item = &Subsystem> {
        self.subsystems.values()
    }

    pub fn subsystems_mut(&mut self) -> impl Iterator<Item = &mut Subsystem> {
        self.subsystems.values_mut()
    }

    pub fn sensor(&self, name: &str) -> Option<&Sensor> {
        let owner = self.sensors.get(name)?;
        self.subsystems.get(owner)?.sensors.get(name)
    }

    pub fn sensor_mut(&mut self, name: &str) -> Option<&mut Sensor> {
        let owner = self.sensors.get(name)?;
        self.subsystems.get_mut(owner)?.sensors.get_mut(name)
    }

    pub fn sensors(&self) -> impl Iterator<Item = &Sensor> {
        self.subsystems.values().flat_map(|s| s.sensors.values())
    }

    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    pub fn len(&self) -> usize {
        self.subsystems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subsystems.is_empty()
    }

    /// Returns the valid subsystem for `row`, loading it if needed.
    ///
    /// Load failures are logged and yield `None`; nothing is registered
    /// for a subsystem that did not load completely.
    pub async fn get_or_create(
        &mut self,
        row: &SubsystemRow,
        catalog: &mut dyn HardwareCatalog,
        reader: &SensorReader,
    ) -> Option<&mut Subsystem> {
        match self.subsystems.get(&row.name) {
            Some(existing) if existing.valid => return self.subsystems.get_mut(&row.name),
            Some(_) => self.remove(&row.name, catalog),
            None => {}
        }

        let subsystem = match self.load(row, catalog, reader).await {
            Ok(subsystem) => subsystem,
            Err(e) => {
                error!("Failed to add subsystem {}: {e:#}", row.name);
                catalog.unload(&row.name);
                return None;
            }
        };

        info!(
            "Added subsystem {} with {} sensors (auto shutdown: {})",
            subsystem.name,
            subsystem.sensors.len(),
            subsystem.auto_shutdown
        );

        for sensor in subsystem.sensors.keys() {
            self.sensors.insert(sensor.clone(), subsystem.name.clone());
        }
        Some(self.subsystems.entry(row.name.clone()).or_insert(subsystem))
    }

    async fn load(
        &self,
        row: &SubsystemRow,
        catalog: &mut dyn HardwareCatalog,
        reader: &SensorReader,
    ) -> Result<Subsystem> {
        let name = row.name.as_str();
        debug!("Adding new subsystem {name}");

        catalog
            .load(name, Path::new(&row.hw_desc_dir))
            .with_context(|| format!("Error reading h/w description for subsystem {name}"))?;

        let policy = catalog
            .thermal_policy(name)
            .ok_or_else(|| anyhow!("No thermal info for subsystem {name}"))?;

        let count = catalog.sensor_count(name);
        if count == 0 {
            bail!("No temperature sensors described for subsystem {name}");
        }

        let mut subsystem = Subsystem::new(name, policy.auto_shutdown);
        for index in 0..count {
            let descriptor = catalog
                .sensor_descriptor(name, index)
                .ok_or_else(|| anyhow!("Missing sensor {index} of subsystem {name}"))?;
            let device = catalog.device(name, &descriptor.device);

            let mut sensor = Sensor::new(name, descriptor, device);
            if let Some(owner) = self.sensors.get(&sensor.name) {
                bail!("Sensor {} already registered by subsystem {owner}", sensor.name);
            }
            if subsystem.sensors.contains_key(&sensor.name) {
                bail!("Sensor {} described twice", sensor.name);
            }

            debug!(
                "Adding sensor {} ({}) in subsystem {name}",
                sensor.descriptor.number, sensor.descriptor.location
            );
            reader.read(&mut sensor).await;
            subsystem.sensors.insert(sensor.name.clone(), sensor);
        }

        subsystem.valid = true;
        Ok(subsystem)
    }

    /// Synchronizes the registry with the configured subsystem rows.
    pub async fn reconcile(
        &mut self,
        rows: &[SubsystemRow],
        catalog: &mut dyn HardwareCatalog,
        reader: &SensorReader,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for subsystem in self.subsystems.values_mut() {
            subsystem.marked = false;
        }

        for row in rows {
            let existed = self.subsystems.contains_key(&row.name);
            if let Some(subsystem) = self.get_or_create(row, catalog, reader).await {
                subsystem.marked = true;
                if !existed {
                    report.created.push(row.name.clone());
                }
            }
        }

        let unmarked: Vec<String> = self
            .subsystems
            .values()
            .filter(|s| !s.marked)
            .map(|s| s.name.clone())
            .collect();

        for name in unmarked {
            info!("Removing subsystem {name}");
            self.remove(&name, catalog);
            report.removed.push(name);
        }

        report
    }

    fn remove(&mut self, name: &str, catalog: &mut dyn HardwareCatalog) {
        if let Some(subsystem) = self.subsystems.remove(name) {
            for sensor in subsystem.sensors.keys() {
                self.sensors.remove(sensor);
            }
        }
        catalog.unload(name);
    }

    /// Sets (`Some`) or clears (`None`) a sensor's test temperature.
    pub fn set_test_temperature(&mut self, sensor: &str, temp: Option<i32>) -> Result<()> {
        let sensor = self
            .sensor_mut(sensor)
            .ok_or_else(|| anyhow!("Sensor does not exist"))?;
        sensor.test_temp = temp;
        Ok(())
    }

    /// Renders the whole model for the debug surface.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        if let Err(e) = self.write_dump(&mut out) {
            error!("Failed to render support dump: {e}");
        }
        out
    }

    fn write_dump(&self, out: &mut impl fmt::Write) -> fmt::Result {
        writeln!(out, "Support Dump for Platform Temperature Daemon (tempd)")?;

        for subsystem in self.subsystems.values() {
            writeln!(out, "\nSubsystem: {}", subsystem.name)?;
            for sensor in subsystem.sensors.values() {
                write_sensor(out, sensor)?;
            }
        }
        Ok(())
    }
}

fn write_sensor(out: &mut impl fmt::Write, sensor: &Sensor) -> fmt::Result {
    let d = &sensor.descriptor;
    let a = &d.alarm_thresholds;
    let f = &d.fan_thresholds;

    writeln!(out, "\tSensor name: {}", sensor.name)?;
    writeln!(out, "\t\tLocation: {}", d.location)?;
    writeln!(out, "\t\tDevice name: {}", d.device)?;
    writeln!(out, "\t\tType: {}", d.kind)?;
    writeln!(out, "\t\tStatus: {}", sensor.status)?;
    writeln!(out, "\t\tFan speed: {}", sensor.fan_speed)?;
    writeln!(out, "\t\tTemperature: {}", sensor.temp / MILLI_DEGREES)?;
    writeln!(out, "\t\tMin temp: {}", sensor.min / MILLI_DEGREES)?;
    writeln!(out, "\t\tMax temp: {}", sensor.max / MILLI_DEGREES)?;
    writeln!(out, "\t\tFault count: {}", sensor.fault_count)?;
    if let Some(test) = sensor.test_temp {
        writeln!(out, "\t\tTest temperature: {test}")?;
    }

    writeln!(out, "\t\tAlarm Thresholds: ")?;
    for (label, value) in [
        ("emergency_on", a.emergency_on),
        ("emergency_off", a.emergency_off),
        ("critical_on", a.critical_on),
        ("critical_off", a.critical_off),
        ("max_on", a.max_on),
        ("max_off", a.max_off),
        ("min", a.min),
        ("low_crit", a.low_crit),
    ] {
        writeln!(out, "\t\t\t{label}: {value:.2}")?;
    }

    writeln!(out, "\t\tFan Thresholds: ")?;
    for (label, value) in [
        ("max_on", f.max_on),
        ("max_off", f.max_off),
        ("fast_on", f.fast_on),
        ("fast_off", f.fast_off),
        ("medium_on", f.medium_on),
        ("medium_off", f.medium_off),
    ] {
        writeln!(out, "\t\t\t{label}: {value:.2}")?;
    }
    Ok(())
}
