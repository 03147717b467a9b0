use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::{
    event::{Event, EventBus},
    providers::traits::ServiceProvider,
    task_manager::TaskManager,
};

/// Log target audit events are written under.
pub const AUDIT_TARGET: &str = "tempd::event";

/// Audit event log service provider.
///
/// Subscribes to the event bus and writes every audit event
/// (unrecognized sensors, emergency shutdowns, subsystem changes) as one
/// structured line under the `tempd::event` log target.
///
/// # Priority and Criticality
///
/// - **Priority**: 4 (low)
/// - **Critical**: No
pub struct AuditLogServiceProvider {
    event_bus: EventBus,
}

impl AuditLogServiceProvider {
    pub fn new(event_bus: EventBus) -> Self {
        Self { event_bus }
    }
}

#[async_trait]
impl ServiceProvider for AuditLogServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let events = self.event_bus.subscribe();

        task_manager
            .spawn_task(self.name().to_string(), |cancel_token| async move {
                run_audit_log_service(events, cancel_token).await
            })
            .await
    }

    fn name(&self) -> &'static str {
        "AuditLogService"
    }

    fn priority(&self) -> i32 {
        4
    }
}

/// One audit line, `None` for internal signals.
fn audit_line(event: &Event) -> Option<String> {
    event.audit_tag().map(|tag| format!("{tag} {event}"))
}

async fn run_audit_log_service(
    mut events: tokio::sync::broadcast::Receiver<Event>,
    cancel_token: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("Audit log service cancelled");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(line) = audit_line(&event) {
                        info!(target: AUDIT_TARGET, "{line}");
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!(target: AUDIT_TARGET, "{n} audit events lost");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn audit_lines_carry_tag_and_fields() {
        assert_eq!(
            audit_line(&Event::EmergencyShutdown {
                sensor: "base-1".into()
            }),
            Some("TEMP_SENSOR_SHUTDOWN name=base-1".to_string())
        );
        assert_eq!(
            audit_line(&Event::SubsystemAdded {
                name: "base".into(),
                sensors: 2
            }),
            Some("SUBSYSTEM_ADDED subsystem=base sensors=2".to_string())
        );
        assert_eq!(audit_line(&Event::StoreChanged), None);
    }

    #[tokio::test]
    async fn service_runs_until_cancelled() {
        let event_bus = EventBus::new();
        let provider = AuditLogServiceProvider::new(event_bus.clone());
        let mut task_manager = TaskManager::new();

        provider.start(&mut task_manager).await.unwrap();
        event_bus
            .publish(Event::SensorUnrecognized {
                sensor: "base-3".into(),
                kind: "tmp102".into(),
            })
            .unwrap();

        assert_eq!(provider.priority(), 4);
        assert!(!provider.is_critical());
        task_manager.shutdown_all().await.unwrap();
    }
}
