//! Set-if-different publishing of the in-memory model into the state store.

use log::debug;

use crate::{
    model::{Sensor, SensorStatus},
    registry::SubsystemRegistry,
    store::{SensorField, StoreDocument, StoreOp, StoreTxn, TempSensorRecord},
};

/// Persisted form of a sensor.
pub fn record(sensor: &Sensor) -> TempSensorRecord {
    TempSensorRecord {
        name: sensor.name.clone(),
        location: sensor.descriptor.location.clone(),
        temperature: sensor.temp,
        min: sensor.min,
        max: sensor.max,
        status: sensor.status,
        fan_state: sensor.fan_speed,
    }
}

/// Queues every field that differs between the registry and `document`.
///
/// Sensors without a persisted record are inserted whole. Records without
/// a sensor behind them are downgraded to `uninitialized` instead of being
/// left with stale readings.
pub fn diff(registry: &SubsystemRegistry, document: &StoreDocument, txn: &mut StoreTxn) {
    for sensor in registry.sensors() {
        match document.sensor(&sensor.name) {
            Some(persisted) => diff_record(&record(sensor), persisted, txn),
            None => {
                debug!("Publishing new sensor record {}", sensor.name);
                txn.push(StoreOp::InsertSensor(record(sensor)));
            }
        }
    }

    for persisted in &document.temp_sensors {
        if registry.sensor(&persisted.name).is_none()
            && persisted.status != SensorStatus::Uninitialized
        {
            debug!("No sensor behind record {}, marking uninitialized", persisted.name);
            txn.set_sensor(
                &persisted.name,
                SensorField::Status(SensorStatus::Uninitialized),
            );
        }
    }
}

fn diff_record(current: &TempSensorRecord, persisted: &TempSensorRecord, txn: &mut StoreTxn) {
    let name = &current.name;

    if current.status != persisted.status {
        txn.set_sensor(name, SensorField::Status(current.status));
    }
    if current.temperature != persisted.temperature {
        txn.set_sensor(name, SensorField::Temperature(current.temperature));
    }
    if current.min != persisted.min {
        txn.set_sensor(name, SensorField::Min(current.min));
    }
    if current.max != persisted.max {
        txn.set_sensor(name, SensorField::Max(current.max));
    }
    if current.fan_state != persisted.fan_state {
        txn.set_sensor(name, SensorField::FanState(current.fan_state));
    }
    if current.location != persisted.location {
        txn.set_sensor(name, SensorField::Location(current.location.clone()));
    }
}

/// Queues the sensor-name list of a freshly loaded subsystem.
pub fn link_subsystem(registry: &SubsystemRegistry, subsystem: &str, txn: &mut StoreTxn) {
    let Some(subsystem) = registry.subsystem(subsystem) else {
        return;
    };
    txn.push(StoreOp::SetSubsystemSensors {
        subsystem: subsystem.name.clone(),
        sensors: subsystem.sensors.keys().cloned().collect(),
    });
}

/// Queues `cur_hw = 1` for every daemon record belonging to `daemon_name`.
///
/// Returns whether any such record exists; records already at 1 need no op.
pub fn mark_hw_ready(document: &StoreDocument, daemon_name: &str, txn: &mut StoreTxn) -> bool {
    let mut found = false;
    for daemon in document
        .daemons
        .iter()
        .filter(|d| d.name.starts_with(daemon_name))
    {
        found = true;
        if daemon.cur_hw != 1 {
            txn.push(StoreOp::SetDaemonCurHw {
                daemon: daemon.name.clone(),
                cur_hw: 1,
            });
        }
    }
    found
}
