//! # tempd
//!
//! A Linux daemon that watches the platform temperature sensors of a switch.
//!
//! ## Features
//!
//! - **Subsystem discovery**: subsystems come and go through the state store
//!   and are reconciled against a YAML hardware description
//! - **Sensor reads**: LM75-family sensors over i2c-dev, with a fault budget
//! - **Thermal ladder**: hysteresis on both alarm status and fan demand
//! - **Emergency shutdown**: a sustained emergency reading powers the box off
//! - **State store publishing**: only changed fields are written, one
//!   transaction per poll
//! - **D-Bus control**: support dump and test temperature injection
//!
//! ## Architecture
//!
//! The daemon uses the provider-based service layout:
//! - [`SystemCoordinator`](coordinator::SystemCoordinator) - lifecycle manager
//! - [`EventBus`](event::EventBus) - inter-service communication
//! - [`PollLoop`](poll::PollLoop) - sole owner of the sensor model
//! - Service providers for everything that runs in the background
//!
//! ## Example
//!
//! ```no_run
//! use tempd::{application::Application, config::ConfigManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config_manager = ConfigManager::load(None).await?;
//!     Application::builder()
//!         .with_config_manager(config_manager)
//!         .build()
//!         .await?
//!         .run()
//!         .await
//! }
//! ```

pub mod app_context;
pub mod application;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod emergency;
pub mod event;
pub mod interface;
pub mod model;
pub mod poll;
pub mod providers;
pub mod publisher;
pub mod reader;
pub mod registry;
pub mod sensors;
pub mod store;
pub mod task_manager;
pub mod temperature_sensors;
pub mod thresholds;
