//! Event-driven communication between services, including audit events.

use std::fmt;

use anyhow::Result;
use tokio::sync::broadcast;

/// Application events for inter-service communication.
///
/// Variants with an [`Event::audit_tag`] are audit events and end up in the
/// event log through the audit service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The state store changed on disk; poll now instead of at the next tick.
    StoreChanged,
    /// Explicit stop request from the control surface.
    SystemShutdown,
    SensorUnrecognized { sensor: String, kind: String },
    EmergencyShutdown { sensor: String },
    SubsystemAdded { name: String, sensors: usize },
    SubsystemRemoved { name: String },
}

impl Event {
    /// Event log tag for audit events, `None` for internal signals.
    pub const fn audit_tag(&self) -> Option<&'static str> {
        match self {
            Event::SensorUnrecognized { .. } => Some("TEMP_SENSOR_UNRECOGNIZED"),
            Event::EmergencyShutdown { .. } => Some("TEMP_SENSOR_SHUTDOWN"),
            Event::SubsystemAdded { .. } => Some("SUBSYSTEM_ADDED"),
            Event::SubsystemRemoved { .. } => Some("SUBSYSTEM_REMOVED"),
            Event::StoreChanged | Event::SystemShutdown => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::StoreChanged => write!(f, "store changed"),
            Event::SystemShutdown => write!(f, "shutdown requested"),
            Event::SensorUnrecognized { sensor, kind } => {
                write!(f, "name={sensor} type={kind}")
            }
            Event::EmergencyShutdown { sensor } => write!(f, "name={sensor}"),
            Event::SubsystemAdded { name, sensors } => {
                write!(f, "subsystem={name} sensors={sensors}")
            }
            Event::SubsystemRemoved { name } => write!(f, "subsystem={name}"),
        }
    }
}

/// Event bus for publish-subscribe messaging between services.
///
/// # Example
///
/// ```no_run
/// use tempd::event::{Event, EventBus};
///
/// let event_bus = EventBus::new();
/// let mut subscriber = event_bus.subscribe();
///
/// event_bus.publish(Event::StoreChanged).unwrap();
///
/// // In async context, receive events:
/// // let event = subscriber.recv().await;
/// ```
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Creates a new EventBus with default capacity.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(100);
        Self { sender }
    }

    #[cfg(test)]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns an error if there are no active subscribers.
    pub fn publish(&self, event: Event) -> Result<()> {
        self.sender.send(event)?;
        Ok(())
    }

    /// Publishes an event nobody is required to hear.
    pub fn emit(&self, event: Event) {
        if let Err(e) = self.publish(event) {
            log::debug!("Event dropped, no subscribers: {e}");
        }
    }

    /// Creates a new subscriber to receive events.
    ///
    /// Each subscriber receives all events published after subscription.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
