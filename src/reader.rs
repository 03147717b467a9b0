//! Sensor reading: transducer access, fault budget and test overrides.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use log::{debug, warn};

use crate::{
    event::{Event, EventBus},
    model::{MILLI_DEGREES, Sensor, SensorStatus},
    sensors::SensorTransducer,
    temperature_sensors::lm75,
    thresholds::{self, AlarmRuleSet},
};

/// Consecutive failed reads tolerated before a sensor is marked `fault`.
pub const MAX_FAIL_RETRY: u32 = 2;

/// Reading substituted for sensors of an unrecognized type.
pub const FALLBACK_TEMPERATURE: i32 = 35 * MILLI_DEGREES;

/// What a single read did to the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Test override in place; status forced to `normal`, ladder skipped.
    Override(i32),
    /// Fresh transducer reading, run through the ladder.
    Reading(i32),
    /// Unrecognized sensor type; fallback reading run through the ladder.
    Fallback(i32),
    /// Failed read within the budget; last known values kept.
    Fault { count: u32 },
    /// Budget exhausted; the sensor is `fault`.
    Failed,
}

/// Reads sensors and advances their alarm and fan state.
pub struct SensorReader {
    transducer: Arc<dyn SensorTransducer>,
    events: EventBus,
    rules: AlarmRuleSet,
}

impl SensorReader {
    pub fn new(transducer: Arc<dyn SensorTransducer>, events: EventBus, rules: AlarmRuleSet) -> Self {
        Self {
            transducer,
            events,
            rules,
        }
    }

    /// Reads `sensor` once and evaluates the result.
    ///
    /// Never fails: transducer errors are absorbed into the fault counter so
    /// one bad sensor cannot hold up its siblings.
    pub async fn read(&self, sensor: &mut Sensor) -> ReadOutcome {
        if let Some(temp) = sensor.test_temp {
            debug!("{}: test temperature override set to {temp}", sensor.name);
            sensor.status = SensorStatus::Normal;
            sensor.temp = temp;
            return ReadOutcome::Override(temp);
        }

        let outcome = if sensor.descriptor.kind == lm75::LM75 {
            match self.sample(sensor).await {
                Ok(temp) => {
                    sensor.fault_count = 0;
                    if sensor.status == SensorStatus::Failed {
                        sensor.status = SensorStatus::Normal;
                    }
                    ReadOutcome::Reading(temp)
                }
                Err(e) => return self.record_fault(sensor, &e),
            }
        } else {
            warn!(
                "Unrecognized sensor type {} for {}",
                sensor.descriptor.kind, sensor.name
            );
            self.events.emit(Event::SensorUnrecognized {
                sensor: sensor.name.clone(),
                kind: sensor.descriptor.kind.clone(),
            });
            ReadOutcome::Fallback(FALLBACK_TEMPERATURE)
        };

        let (ReadOutcome::Reading(temp) | ReadOutcome::Fallback(temp)) = outcome else {
            return outcome;
        };

        sensor.temp = temp;
        let next = thresholds::advance(sensor.thermal_state(), temp, &sensor.descriptor, self.rules);
        sensor.apply(next);

        debug!(
            "{}: {:4.1}c status={} fan={}",
            sensor.name,
            thresholds::to_celsius(temp),
            sensor.status,
            sensor.fan_speed
        );

        outcome
    }

    async fn sample(&self, sensor: &Sensor) -> Result<i32> {
        let device = sensor.device.as_deref().ok_or_else(|| {
            anyhow!(
                "device {} not described for subsystem {}",
                sensor.descriptor.device,
                sensor.subsystem
            )
        })?;

        let raw = self.transducer.read(device, &sensor.subsystem).await?;
        lm75::decode(&raw)
    }

    fn record_fault(&self, sensor: &mut Sensor, error: &anyhow::Error) -> ReadOutcome {
        sensor.fault_count += 1;

        if sensor.fault_count > MAX_FAIL_RETRY {
            if sensor.status != SensorStatus::Failed {
                warn!(
                    "{}: {} consecutive read failures, marking as fault: {error:#}",
                    sensor.name, sensor.fault_count
                );
            }
            sensor.status = SensorStatus::Failed;
            return ReadOutcome::Failed;
        }

        debug!(
            "{}: read failure {} of {MAX_FAIL_RETRY} tolerated: {error:#}",
            sensor.name, sensor.fault_count
        );
        ReadOutcome::Fault {
            count: sensor.fault_count,
        }
    }
}
