//! System coordinator: builds the shared state, starts services, waits for shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use log::{error, info, warn};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::broadcast::error::RecvError,
};

use crate::{
    app_context::AppState,
    config::ConfigManager,
    event::{Event, EventBus},
    providers::{
        AppStateProvider, AsyncProvider, AuditLogServiceProvider, ControlServiceProvider,
        PollServiceProvider, ServiceProvider, StoreWatcherServiceProvider,
    },
    task_manager::TaskManager,
};

/// How often critical service tasks are checked for an unexpected exit.
const HEALTH_CHECK: Duration = Duration::from_secs(1);

/// Owns every service of the daemon and their lifecycle.
///
/// Services are registered by priority; critical ones must start and must
/// keep running, otherwise the daemon shuts down with an error.
pub struct SystemCoordinator {
    task_manager: TaskManager,
    event_bus: EventBus,
    shared_state: Option<Arc<AppState>>,
    service_providers: Vec<Box<dyn ServiceProvider>>,
}

impl Default for SystemCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemCoordinator {
    pub fn new() -> Self {
        Self::with_event_bus(EventBus::new())
    }

    pub fn with_event_bus(event_bus: EventBus) -> Self {
        Self {
            task_manager: TaskManager::new(),
            event_bus,
            shared_state: None,
            service_providers: Vec::new(),
        }
    }

    /// Builds the application state from the configuration and registers services.
    pub async fn initialize(&mut self, config_manager: ConfigManager) -> Result<()> {
        info!("Initializing SystemCoordinator...");

        let state = AppStateProvider::new(config_manager, self.event_bus.clone())
            .provide()
            .await
            .context("Failed to initialize application state")?;

        self.initialize_with_state(state).await
    }

    /// Registers services around an already built state.
    pub async fn initialize_with_state(&mut self, state: Arc<AppState>) -> Result<()> {
        self.shared_state = Some(state.clone());
        self.register_service_providers(state)
            .await
            .context("Failed to register service providers")?;

        info!("SystemCoordinator initialization completed");
        Ok(())
    }

    async fn register_service_providers(&mut self, state: Arc<AppState>) -> Result<()> {
        let mut providers: Vec<Box<dyn ServiceProvider>> = vec![
            Box::new(PollServiceProvider::new(state.clone())),
            Box::new(AuditLogServiceProvider::new(self.event_bus.clone())),
        ];

        if let Some(store_path) = state.store_path() {
            providers.push(Box::new(StoreWatcherServiceProvider::new(
                store_path.to_path_buf(),
                self.event_bus.clone(),
            )));
        }

        if state.config().await.dbus.enabled {
            match ControlServiceProvider::new(state.clone(), self.event_bus.clone()).await {
                Ok(provider) => providers.push(Box::new(provider)),
                Err(e) => warn!("Failed to create control service provider: {e:#}, skipping"),
            }
        } else {
            info!("D-Bus control surface disabled by configuration");
        }

        providers.sort_by_key(|p| std::cmp::Reverse(p.priority()));
        self.service_providers = providers;

        info!(
            "Registered {} service providers in priority order",
            self.service_providers.len()
        );
        Ok(())
    }

    /// Starts services in priority order.
    ///
    /// A critical service that fails to start aborts startup; others are
    /// skipped with a warning.
    pub async fn start_all_services(&mut self) -> Result<()> {
        info!(
            "Starting {} services in priority order...",
            self.service_providers.len()
        );

        for provider in &self.service_providers {
            let is_critical = provider.is_critical();

            match provider.start(&mut self.task_manager).await {
                Ok(()) => info!(
                    "Service '{}' started (priority: {}, critical: {})",
                    provider.name(),
                    provider.priority(),
                    is_critical
                ),
                Err(e) if is_critical => {
                    return Err(e).with_context(|| {
                        format!("Critical service '{}' failed to start", provider.name())
                    });
                }
                Err(e) => warn!(
                    "Non-critical service '{}' failed to start: {e:#}",
                    provider.name()
                ),
            }
        }

        info!("All critical services started");
        Ok(())
    }

    /// Waits for SIGINT, SIGTERM, a shutdown event or a dead critical service.
    pub async fn run_main_loop(&mut self) -> Result<()> {
        let mut event_rx = self.event_bus.subscribe();
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut health = tokio::time::interval(HEALTH_CHECK);
        info!("Starting main event loop");

        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result.context("Failed to listen for SIGINT")?;
                    info!("Received SIGINT, shutting down");
                    self.shutdown().await;
                    break;
                }

                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down");
                    self.shutdown().await;
                    break;
                }

                event = event_rx.recv() => {
                    if self.handle_event(event)? {
                        info!("Shutdown requested over the control interface");
                        self.shutdown().await;
                        break;
                    }
                }

                _ = health.tick() => {
                    if let Some(name) = self.dead_critical_service() {
                        error!("Critical service '{name}' stopped unexpectedly");
                        self.shutdown().await;
                        bail!("Critical service '{name}' stopped");
                    }
                }
            }
        }

        info!("Main event loop terminated");
        Ok(())
    }

    /// Returns `true` when the event asks the daemon to stop.
    fn handle_event(&self, event: Result<Event, RecvError>) -> Result<bool> {
        match event {
            Ok(Event::SystemShutdown) => Ok(true),
            Ok(_) => Ok(false),
            Err(RecvError::Lagged(n)) => {
                warn!("Event bus lagged by {n} messages");
                Ok(false)
            }
            Err(RecvError::Closed) => Err(anyhow!("Event bus channel closed unexpectedly")),
        }
    }

    fn dead_critical_service(&self) -> Option<&'static str> {
        self.service_providers
            .iter()
            .filter(|p| p.is_critical())
            .map(|p| p.name())
            .find(|name| self.task_manager.has_finished(name))
    }

    async fn shutdown(&mut self) {
        info!("Initiating graceful shutdown...");
        if let Err(e) = self.task_manager.shutdown_all().await {
            error!("Error during task shutdown: {e:#}");
        }
        info!("Shutdown complete");
    }

    pub const fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn running_services(&self) -> Vec<&'static str> {
        self.service_providers.iter().map(|p| p.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{app_context::tests::memory_state, store::MemoryStore};
    use pretty_assertions::assert_eq;
    use tokio::time::timeout;

    async fn coordinator_without_bus() -> SystemCoordinator {
        let event_bus = EventBus::new();
        let state = memory_state(MemoryStore::new(), event_bus.clone()).await;
        state.config_manager.get_mut().await.dbus.enabled = false;

        let mut coordinator = SystemCoordinator::with_event_bus(event_bus);
        coordinator.initialize_with_state(state).await.unwrap();
        coordinator
    }

    #[tokio::test]
    async fn registers_services_by_priority() {
        let coordinator = coordinator_without_bus().await;

        assert_eq!(
            coordinator.running_services(),
            vec!["PollService", "AuditLogService"]
        );
    }

    #[tokio::test]
    async fn shutdown_event_stops_main_loop() {
        let mut coordinator = coordinator_without_bus().await;
        coordinator.start_all_services().await.unwrap();
        let event_bus = coordinator.event_bus().clone();

        let main_loop = tokio::spawn(async move { coordinator.run_main_loop().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        event_bus.publish(Event::SystemShutdown).unwrap();

        let result = timeout(Duration::from_secs(15), main_loop).await.unwrap();
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn poll_service_cannot_start_twice() {
        let mut coordinator = coordinator_without_bus().await;
        coordinator.start_all_services().await.unwrap();

        let state = coordinator.shared_state.clone().unwrap();
        let mut other = TaskManager::new();
        let err = PollServiceProvider::new(state)
            .start(&mut other)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already running"));

        coordinator.shutdown().await;
    }

    #[test]
    fn closed_bus_is_an_error() {
        let coordinator = SystemCoordinator::new();

        assert!(!coordinator.handle_event(Ok(Event::StoreChanged)).unwrap());
        assert!(coordinator.handle_event(Ok(Event::SystemShutdown)).unwrap());
        assert!(!coordinator.handle_event(Err(RecvError::Lagged(3))).unwrap());
        assert!(coordinator.handle_event(Err(RecvError::Closed)).is_err());
    }
}
