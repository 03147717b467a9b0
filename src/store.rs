//! State store boundary: persisted subsystem, sensor and daemon records.
//!
//! The daemon reads the configured subsystem list from the store and
//! publishes sensor readings back into it, one transaction per poll. The
//! store also provides the advisory lock that keeps a second daemon
//! instance from publishing at the same time.

pub mod json_file;
pub mod memory;

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::model::{FanSpeed, SensorStatus};

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

/// Ownership of the store's single-writer lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// This instance may reconcile and publish.
    Held,
    /// Another instance holds the lock.
    Contended,
    /// Lock not yet granted, nothing known about peers.
    Pending,
}

/// Externally configured subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsystemRow {
    pub name: String,
    /// Hardware description directory.
    #[serde(default)]
    pub hw_desc_dir: String,
    /// Names of the sensor records belonging to this subsystem.
    #[serde(default)]
    pub temp_sensors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempSensorRecord {
    pub name: String,
    pub location: String,
    pub temperature: i32,
    pub min: i32,
    pub max: i32,
    pub status: SensorStatus,
    pub fan_state: FanSpeed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonRecord {
    pub name: String,
    #[serde(default)]
    pub cur_hw: i64,
}

/// Full content of the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub subsystems: Vec<SubsystemRow>,
    #[serde(default)]
    pub temp_sensors: Vec<TempSensorRecord>,
    #[serde(default)]
    pub daemons: Vec<DaemonRecord>,
}

/// Single column of a sensor record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorField {
    Status(SensorStatus),
    Temperature(i32),
    Min(i32),
    Max(i32),
    FanState(FanSpeed),
    Location(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    InsertSensor(TempSensorRecord),
    SetSensor { name: String, field: SensorField },
    SetSubsystemSensors { subsystem: String, sensors: Vec<String> },
    SetDaemonCurHw { daemon: String, cur_hw: i64 },
}

/// Ordered batch of writes committed together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreTxn {
    ops: Vec<StoreOp>,
}

impl StoreTxn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: StoreOp) {
        self.ops.push(op);
    }

    pub fn set_sensor(&mut self, name: &str, field: SensorField) {
        self.push(StoreOp::SetSensor {
            name: name.to_string(),
            field,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }
}

impl StoreDocument {
    pub fn sensor(&self, name: &str) -> Option<&TempSensorRecord> {
        self.temp_sensors.iter().find(|r| r.name == name)
    }

    /// Applies every op of `txn` in order.
    pub fn apply(&mut self, txn: &StoreTxn) {
        for op in txn.ops() {
            match op {
                StoreOp::InsertSensor(record) => {
                    match self.temp_sensors.iter_mut().find(|r| r.name == record.name) {
                        Some(existing) => *existing = record.clone(),
                        None => self.temp_sensors.push(record.clone()),
                    }
                }
                StoreOp::SetSensor { name, field } => {
                    let Some(record) = self.temp_sensors.iter_mut().find(|r| &r.name == name)
                    else {
                        debug!("Dropping update for missing sensor record {name}");
                        continue;
                    };
                    match field {
                        SensorField::Status(status) => record.status = *status,
                        SensorField::Temperature(temp) => record.temperature = *temp,
                        SensorField::Min(min) => record.min = *min,
                        SensorField::Max(max) => record.max = *max,
                        SensorField::FanState(speed) => record.fan_state = *speed,
                        SensorField::Location(location) => record.location = location.clone(),
                    }
                }
                StoreOp::SetSubsystemSensors { subsystem, sensors } => {
                    if let Some(row) = self.subsystems.iter_mut().find(|r| &r.name == subsystem) {
                        row.temp_sensors = sensors.clone();
                    }
                }
                StoreOp::SetDaemonCurHw { daemon, cur_hw } => {
                    if let Some(record) = self.daemons.iter_mut().find(|d| &d.name == daemon) {
                        record.cur_hw = *cur_hw;
                    }
                }
            }
        }
    }

    /// Subsystem identity as far as reconciliation is concerned.
    pub(crate) fn subsystem_keys(&self) -> Vec<(String, String)> {
        self.subsystems
            .iter()
            .map(|row| (row.name.clone(), row.hw_desc_dir.clone()))
            .collect()
    }
}

/// Snapshot handed to the poll loop by [`StateStore::refresh`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreView {
    pub lock: LockState,
    /// Changes whenever the configured subsystem set changes.
    pub seqno: u64,
    pub document: StoreDocument,
}

#[async_trait]
pub trait StateStore: Send {
    /// Re-reads the store and (re)tries the single-writer lock.
    async fn refresh(&mut self) -> Result<StoreView>;

    /// Commits `txn` atomically.
    async fn commit(&mut self, txn: StoreTxn) -> Result<()>;

    /// Backing file, if any, for change notifications.
    fn watch_path(&self) -> Option<&Path> {
        None
    }
}
