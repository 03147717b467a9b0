use log::info;
use zbus::{fdo, interface, object_server::SignalEmitter};

use crate::{
    event::{Event, EventBus},
    poll::ControlHandle,
};

pub const OBJECT_PATH: &str = "/io/github/tempd";
pub const BUS_NAME: &str = "io.github.tempd";

/// Debug and test surface of the daemon.
pub struct ControlInterface {
    control: ControlHandle,
    event_bus: EventBus,
    version: String,
}

impl ControlInterface {
    pub fn new(control: ControlHandle, version: String, event_bus: EventBus) -> Self {
        Self {
            control,
            event_bus,
            version,
        }
    }
}

/// Sentinel test temperature that clears the override.
const NO_OVERRIDE: i32 = -1;

fn test_override(millidegrees: i32) -> Option<i32> {
    (millidegrees != NO_OVERRIDE).then_some(millidegrees)
}

fn failed(e: anyhow::Error) -> fdo::Error {
    fdo::Error::Failed(e.to_string())
}

#[interface(name = "io.github.tempd1")]
impl ControlInterface {
    #[zbus(signal)]
    async fn stopped(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

    async fn stop(&self, #[zbus(signal_emitter)] emitter: SignalEmitter<'_>) -> fdo::Result<()> {
        info!("Stop requested over D-Bus");
        emitter.stopped().await?;
        self.event_bus
            .publish(Event::SystemShutdown)
            .map_err(failed)?;

        Ok(())
    }

    /// Renders the subsystem and sensor model.
    async fn dump(&self) -> fdo::Result<String> {
        self.control.dump().await.map_err(failed)
    }

    /// Overrides a sensor reading in milli-degrees; `-1` clears it.
    async fn set_test_temperature(&self, sensor: String, millidegrees: i32) -> fdo::Result<()> {
        self.control
            .set_test_temperature(&sensor, test_override(millidegrees))
            .await
            .map_err(failed)
    }

    #[zbus(property)]
    async fn version(&self) -> String {
        self.version.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::ControlRequest;
    use pretty_assertions::assert_eq;

    #[test]
    fn only_the_sentinel_clears_override() {
        assert_eq!(test_override(-1), None);
        assert_eq!(test_override(-5_000), Some(-5_000));
        assert_eq!(test_override(0), Some(0));
        assert_eq!(test_override(85_500), Some(85_500));
    }

    #[tokio::test]
    async fn methods_forward_to_the_poll_loop() {
        let (control, mut rx) = ControlHandle::channel(4);
        let interface = ControlInterface::new(control, "1.0.0".into(), EventBus::new());

        let server = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(request) = rx.recv().await {
                match request {
                    ControlRequest::Dump { reply } => {
                        let _ = reply.send("dump".to_string());
                    }
                    ControlRequest::SetTestTemperature {
                        sensor,
                        temp,
                        reply,
                    } => {
                        let result = if sensor == "base-1" {
                            Ok(())
                        } else {
                            Err(anyhow::anyhow!("Sensor does not exist"))
                        };
                        seen.push((sensor, temp));
                        let _ = reply.send(result);
                    }
                }
            }
            seen
        });

        assert_eq!(interface.dump().await.unwrap(), "dump");
        interface
            .set_test_temperature("base-1".into(), -1)
            .await
            .unwrap();
        interface
            .set_test_temperature("base-1".into(), -5_000)
            .await
            .unwrap();
        let err = interface
            .set_test_temperature("nope-1".into(), 40_000)
            .await
            .unwrap_err();
        assert!(matches!(err, fdo::Error::Failed(msg) if msg == "Sensor does not exist"));
        assert_eq!(interface.version().await, "1.0.0");

        drop(interface);
        assert_eq!(
            server.await.unwrap(),
            vec![
                ("base-1".to_string(), None),
                ("base-1".to_string(), Some(-5_000)),
                ("nope-1".to_string(), Some(40_000))
            ]
        );
    }
}
