//! Application state shared between services.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use tokio::sync::{Mutex, mpsc};

use crate::{
    catalog::{HardwareCatalog, YamlCatalog},
    config::{Config, ConfigManager},
    emergency::{CommandPowerOff, EmergencyController, PowerOff},
    event::EventBus,
    poll::{ControlHandle, ControlRequest, PollLoop},
    reader::SensorReader,
    sensors::SensorTransducer,
    store::{JsonFileStore, StateStore},
    temperature_sensors::lm75::I2cTransducer,
};

/// Pending control requests before the poll loop drains them.
const CONTROL_QUEUE: usize = 16;

/// Hardware and storage backends the poll loop is assembled from.
pub struct Backends {
    pub store: Box<dyn StateStore>,
    pub catalog: Box<dyn HardwareCatalog>,
    pub transducer: Arc<dyn SensorTransducer>,
    pub power_off: Arc<dyn PowerOff>,
}

impl Backends {
    /// Production backends: JSON store, YAML catalog, i2c-dev, power-off command.
    pub fn from_config(config: &Config) -> Result<Self> {
        let power_off = CommandPowerOff::new(&config.emergency.poweroff_command)
            .context("Invalid emergency power-off command")?;

        Ok(Self {
            store: Box::new(JsonFileStore::new(&config.store.path)),
            catalog: Box::new(YamlCatalog::new()),
            transducer: Arc::new(I2cTransducer::default()),
            power_off: Arc::new(power_off),
        })
    }
}

/// Shared application state.
///
/// The sensor model itself is not in here: it lives inside the [`PollLoop`],
/// which is parked until the poll service takes it. Everyone else reaches
/// the model through the [`ControlHandle`].
pub struct AppState {
    pub config_manager: Arc<ConfigManager>,
    control: ControlHandle,
    poll: Mutex<Option<(PollLoop, mpsc::Receiver<ControlRequest>)>>,
    store_path: Option<PathBuf>,
}

impl AppState {
    /// Creates the state with production backends described by the config.
    pub async fn new(config_manager: ConfigManager, event_bus: EventBus) -> Result<Self> {
        let config = config_manager.clone_config().await;
        let backends = Backends::from_config(&config)?;
        Self::with_backends(config_manager, backends, event_bus).await
    }

    pub async fn with_backends(
        config_manager: ConfigManager,
        backends: Backends,
        event_bus: EventBus,
    ) -> Result<Self> {
        let config = config_manager.clone_config().await;
        let store_path = backends.store.watch_path().map(Path::to_path_buf);

        let reader = SensorReader::new(backends.transducer, event_bus.clone(), config.alarm_rules);
        let emergency = EmergencyController::new(backends.power_off, event_bus.clone());
        let poll = PollLoop::new(
            backends.store,
            backends.catalog,
            reader,
            emergency,
            event_bus,
        )
        .with_daemon_name(config.daemon_name);

        let (control, control_rx) = ControlHandle::channel(CONTROL_QUEUE);

        Ok(Self {
            config_manager: Arc::new(config_manager),
            control,
            poll: Mutex::new(Some((poll, control_rx))),
            store_path,
        })
    }

    /// Gets a read-only reference to the current configuration.
    pub async fn config(&self) -> tokio::sync::RwLockReadGuard<'_, Config> {
        self.config_manager.get().await
    }

    pub fn control(&self) -> &ControlHandle {
        &self.control
    }

    /// State store file to watch for changes, if the store has one.
    pub fn store_path(&self) -> Option<&Path> {
        self.store_path.as_deref()
    }

    /// Hands the poll loop to its runner. Only the first call gets it.
    pub async fn take_poll_loop(&self) -> Option<(PollLoop, mpsc::Receiver<ControlRequest>)> {
        self.poll.lock().await.take()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        emergency::MockPowerOff, sensors::MockSensorTransducer, store::MemoryStore,
    };

    /// State over an in-memory store with steady 30 degree readings.
    pub(crate) async fn memory_state(store: MemoryStore, event_bus: EventBus) -> Arc<AppState> {
        let mut transducer = MockSensorTransducer::new();
        transducer.expect_read().returning(|_, _| Ok(vec![30, 0]));
        let mut power_off = MockPowerOff::new();
        power_off.expect_power_off().never();

        let backends = Backends {
            store: Box::new(store),
            catalog: Box::new(YamlCatalog::new()),
            transducer: Arc::new(transducer),
            power_off: Arc::new(power_off),
        };
        let config_manager = ConfigManager::new(Config::default(), None);
        Arc::new(
            AppState::with_backends(config_manager, backends, event_bus)
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn poll_loop_is_handed_out_once() {
        let state = memory_state(MemoryStore::new(), EventBus::new()).await;

        assert!(state.take_poll_loop().await.is_some());
        assert!(state.take_poll_loop().await.is_none());
    }

    #[tokio::test]
    async fn memory_store_has_nothing_to_watch() {
        let state = memory_state(MemoryStore::new(), EventBus::new()).await;
        assert!(state.store_path().is_none());
    }

    #[tokio::test]
    async fn production_backends_watch_the_configured_store() {
        let mut config = Config::default();
        config.store.path = PathBuf::from("/tmp/tempd-test/state.json");
        let state = AppState::new(ConfigManager::new(config, None), EventBus::new())
            .await
            .unwrap();

        assert_eq!(
            state.store_path(),
            Some(Path::new("/tmp/tempd-test/state.json"))
        );
    }
}
