//! D-Bus control service provider.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use zbus::Connection;

use crate::{
    app_context::AppState,
    config::BusKind,
    event::EventBus,
    interface::{BUS_NAME, ControlInterface, OBJECT_PATH},
    providers::traits::ServiceProvider,
    task_manager::TaskManager,
};

/// D-Bus service provider for the debug and test surface.
///
/// Exports [`ControlInterface`] so operators can dump the sensor model,
/// inject test temperatures and stop the daemon. Polling does not depend
/// on it, so a missing bus only costs the debug surface.
///
/// # Priority and Criticality
///
/// - **Priority**: 8 (high)
/// - **Critical**: No (debug surface only)
///
/// # Interface
///
/// - **Service Name**: `io.github.tempd`
/// - **Object Path**: `/io/github/tempd`
/// - **Interface**: `io.github.tempd1`
pub struct ControlServiceProvider {
    state: Arc<AppState>,
    event_bus: EventBus,
    connection: Connection,
}

impl ControlServiceProvider {
    /// Connects to the bus named in the configuration.
    pub async fn new(state: Arc<AppState>, event_bus: EventBus) -> Result<Self> {
        let bus = state.config().await.dbus.bus;
        let connection = match bus {
            BusKind::System => Connection::system().await,
            BusKind::Session => Connection::session().await,
        }
        .with_context(|| format!("Failed to connect to the {bus:?} bus"))?;

        Ok(Self {
            state,
            event_bus,
            connection,
        })
    }
}

#[async_trait]
impl ServiceProvider for ControlServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let interface = ControlInterface::new(
            self.state.control().clone(),
            env!("CARGO_PKG_VERSION").to_string(),
            self.event_bus.clone(),
        );
        let connection = self.connection.clone();

        task_manager
            .spawn_task(self.name().to_string(), |cancel_token| async move {
                run_control_service(interface, connection, cancel_token).await
            })
            .await
    }

    fn name(&self) -> &'static str {
        "ControlService"
    }

    fn priority(&self) -> i32 {
        8
    }

    fn is_critical(&self) -> bool {
        false
    }
}

async fn run_control_service(
    interface: ControlInterface,
    connection: Connection,
    cancel_token: CancellationToken,
) -> Result<()> {
    connection
        .object_server()
        .at(OBJECT_PATH, interface)
        .await
        .context("Failed to export control interface")?;

    connection
        .request_name(BUS_NAME)
        .await
        .with_context(|| format!("Failed to acquire bus name {BUS_NAME}"))?;
    info!("Control interface exported as {BUS_NAME} at {OBJECT_PATH}");

    cancel_token.cancelled().await;
    info!("Control service cancelled");

    if let Err(e) = connection.release_name(BUS_NAME).await {
        log::warn!("Failed to release bus name {BUS_NAME}: {e}");
    }
    Ok(())
}
