//! Emergency escalation: re-verification and the irreversible power-off.

use std::{convert::Infallible, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use log::{debug, error, warn};
use tokio::process::Command;

use crate::{
    event::{Event, EventBus},
    model::{Sensor, SensorStatus},
    reader::SensorReader,
};

/// Irreversible action taken when a sensor stays in emergency.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PowerOff: Send + Sync {
    async fn power_off(&self) -> Result<()>;
}

/// Powers the box off by running an external command.
#[derive(Debug, Clone)]
pub struct CommandPowerOff {
    program: String,
    args: Vec<String>,
}

impl CommandPowerOff {
    pub fn new(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let Some(program) = parts.next() else {
            bail!("Empty power-off command");
        };
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

#[async_trait]
impl PowerOff for CommandPowerOff {
    async fn power_off(&self) -> Result<()> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .status()
            .await
            .with_context(|| format!("Failed to run {}", self.program))?;

        if !status.success() {
            bail!("{} exited with {status}", self.program);
        }
        Ok(())
    }
}

/// Result of checking one sensor after it was read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Not in emergency.
    Clear,
    /// Emergency did not survive the confirmation read.
    Transient,
    /// Confirmed emergency on a subsystem without auto shutdown.
    Sustained,
    /// Confirmed emergency on an auto shutdown subsystem.
    ShutdownTriggered { sensor: String },
}

/// Confirms an emergency reading with exactly one more read.
///
/// Pure with respect to the outside world: it never powers anything off,
/// it only tells the caller whether it should.
pub async fn verify(reader: &SensorReader, sensor: &mut Sensor, auto_shutdown: bool) -> Verdict {
    if sensor.status != SensorStatus::Emergency {
        return Verdict::Clear;
    }

    debug!("{}: emergency reading, verifying", sensor.name);
    reader.read(sensor).await;

    if sensor.status != SensorStatus::Emergency {
        debug!("{}: emergency not confirmed ({})", sensor.name, sensor.status);
        return Verdict::Transient;
    }

    if !auto_shutdown {
        warn!(
            "{}: emergency confirmed, auto shutdown disabled for subsystem {}",
            sensor.name, sensor.subsystem
        );
        return Verdict::Sustained;
    }

    Verdict::ShutdownTriggered {
        sensor: sensor.name.clone(),
    }
}

/// Carries out a triggered shutdown.
pub struct EmergencyController {
    power_off: Arc<dyn PowerOff>,
    events: EventBus,
}

impl EmergencyController {
    pub fn new(power_off: Arc<dyn PowerOff>, events: EventBus) -> Self {
        Self { power_off, events }
    }

    /// Emits the shutdown audit event, powers off and never returns.
    ///
    /// A failed power-off is logged but not retried; the daemon stays
    /// parked here either way.
    pub async fn halt(&self, sensor: &str) -> Infallible {
        error!("Sensor {sensor} in emergency state, shutting down");
        self.events.emit(Event::EmergencyShutdown {
            sensor: sensor.to_string(),
        });

        if let Err(e) = self.power_off.power_off().await {
            error!("Power-off failed: {e:#}");
        }

        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
}
