//! Application entry point and builder.

use crate::{config::ConfigManager, coordinator::SystemCoordinator};
use anyhow::{Result, anyhow};

/// The temperature daemon: configuration plus the coordinator running it.
///
/// # Example
///
/// ```no_run
/// use tempd::application::Application;
/// use tempd::config;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config_manager = config::ConfigManager::load(None).await?;
/// let mut app = Application::builder()
///     .with_config_manager(config_manager)
///     .build()
///     .await?;
///
/// app.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Application {
    pub coordinator: SystemCoordinator,
    config_manager: ConfigManager,
}

impl Application {
    pub fn builder() -> ApplicationBuilder {
        ApplicationBuilder::new()
    }

    /// Initializes, starts services and blocks until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        self.coordinator
            .initialize(self.config_manager.clone())
            .await?;
        self.coordinator.start_all_services().await?;
        self.coordinator.run_main_loop().await
    }
}

pub struct ApplicationBuilder {
    config_manager: Option<ConfigManager>,
}

impl ApplicationBuilder {
    fn new() -> Self {
        Self {
            config_manager: None,
        }
    }

    pub fn with_config_manager(mut self, config_manager: ConfigManager) -> Self {
        self.config_manager = Some(config_manager);
        self
    }

    /// Validates the configuration and assembles the coordinator.
    pub async fn build(self) -> Result<Application> {
        let config_manager = self
            .config_manager
            .ok_or_else(|| anyhow!("Configuration manager is required"))?;
        config_manager.get().await.validate()?;

        Ok(Application {
            coordinator: SystemCoordinator::new(),
            config_manager,
        })
    }
}
