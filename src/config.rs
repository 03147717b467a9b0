//! Configuration management for the tempd daemon.
//!
//! Handles loading, parsing, and validation of the YAML configuration file
//! that sets the poll period, the state store location, the emergency
//! power-off command and the control surface.

use anyhow::{Context, Result, bail};
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::RwLock;

use crate::thresholds::AlarmRuleSet;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "TEMPD_CONFIG";

/// Main configuration structure for the tempd daemon.
///
/// Every key except `version` has a default, so an empty file (or no file
/// at all) yields a working daemon.
///
/// # Example
///
/// ```yaml
/// version: 1
/// poll_seconds: 5
/// daemon_name: ops-tempd
/// alarm_rules: literal
///
/// store:
///   path: /var/run/tempd/state.json
///
/// emergency:
///   poweroff_command: /sbin/poweroff --poweroff --force --no-wtmp
///
/// dbus:
///   enabled: true
///   bus: system
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Configuration version for compatibility checking.
    pub version: u8,

    /// Poll period in seconds.
    #[serde(default = "defaults::poll_seconds")]
    pub poll_seconds: u16,

    /// Prefix of the daemon record that receives `cur_hw`.
    #[serde(default = "defaults::daemon_name")]
    pub daemon_name: String,

    /// Alarm ladder variant.
    #[serde(default)]
    pub alarm_rules: AlarmRuleSet,

    #[serde(default)]
    pub store: StoreCfg,

    #[serde(default)]
    pub emergency: EmergencyCfg,

    #[serde(default)]
    pub dbus: DBusCfg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreCfg {
    /// JSON state store document.
    #[serde(default = "defaults::store_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyCfg {
    /// Command run, split on whitespace, when a shutdown is triggered.
    #[serde(default = "defaults::poweroff_command")]
    pub poweroff_command: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DBusCfg {
    #[serde(default = "defaults::dbus_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub bus: BusKind,
}

/// Message bus the control interface is exported on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    System,
    Session,
}

mod defaults {
    use std::path::PathBuf;

    pub fn poll_seconds() -> u16 {
        5
    }

    pub fn daemon_name() -> String {
        "ops-tempd".to_string()
    }

    pub fn store_path() -> PathBuf {
        PathBuf::from("/var/run/tempd/state.json")
    }

    pub fn poweroff_command() -> String {
        "/sbin/poweroff --poweroff --force --no-wtmp".to_string()
    }

    pub fn dbus_enabled() -> bool {
        true
    }
}

impl Default for StoreCfg {
    fn default() -> Self {
        Self {
            path: defaults::store_path(),
        }
    }
}

impl Default for EmergencyCfg {
    fn default() -> Self {
        Self {
            poweroff_command: defaults::poweroff_command(),
        }
    }
}

impl Default for DBusCfg {
    fn default() -> Self {
        Self {
            enabled: defaults::dbus_enabled(),
            bus: BusKind::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            poll_seconds: defaults::poll_seconds(),
            daemon_name: defaults::daemon_name(),
            alarm_rules: AlarmRuleSet::default(),
            store: StoreCfg::default(),
            emergency: EmergencyCfg::default(),
            dbus: DBusCfg::default(),
        }
    }
}

impl Config {
    /// Validates the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            bail!("Unsupported config version {}", self.version);
        }
        if self.poll_seconds == 0 {
            bail!("poll_seconds must be greater than zero");
        }
        if self.daemon_name.trim().is_empty() {
            bail!("daemon_name cannot be empty");
        }
        if self.emergency.poweroff_command.trim().is_empty() {
            bail!("emergency.poweroff_command cannot be empty");
        }
        if self.store.path.as_os_str().is_empty() {
            bail!("store.path cannot be empty");
        }
        Ok(())
    }
}

fn locate_config() -> Option<PathBuf> {
    if let Some(env_path) = env::var_os(CONFIG_ENV) {
        return Some(PathBuf::from(env_path));
    }

    if let Some(mut cfg_dir) = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|h| Path::new(&h).join(".config")))
    {
        cfg_dir.push("tempd/config.yml");
        if cfg_dir.exists() {
            return Some(cfg_dir);
        }
    }

    let etc = Path::new("/etc/tempd/config.yml");
    etc.exists().then(|| etc.to_path_buf())
}

/// Configuration manager that owns the loaded config and where it came from.
///
/// # Example
///
/// ```no_run
/// use tempd::config::ConfigManager;
/// use std::path::PathBuf;
///
/// # async fn example() -> anyhow::Result<()> {
/// // Load from specific path
/// let config_manager = ConfigManager::load(Some(PathBuf::from("config.yml"))).await?;
///
/// // Load from standard locations, falling back to defaults
/// let config_manager = ConfigManager::load(None).await?;
///
/// let poll_seconds = config_manager.get().await.poll_seconds;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: Arc<RwLock<Config>>,
    path: Option<PathBuf>,
}

impl ConfigManager {
    pub fn new(config: Config, path: Option<PathBuf>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            path,
        }
    }

    /// Loads configuration from file or standard locations.
    ///
    /// Searches for configuration in the following order:
    /// 1. Provided path parameter
    /// 2. `TEMPD_CONFIG` environment variable
    /// 3. `$XDG_CONFIG_HOME/tempd/config.yml` or `~/.config/tempd/config.yml`
    /// 4. `/etc/tempd/config.yml`
    ///
    /// Built-in defaults are used when none of these exist.
    pub async fn load(path: Option<PathBuf>) -> Result<Self> {
        let Some(config_path) = path.or_else(locate_config) else {
            info!("No configuration file found, using defaults");
            return Ok(Self::new(Config::default(), None));
        };

        info!("Loading config from: {}", config_path.display());
        let config = Self::load_config_from_path(&config_path)?;

        Ok(Self::new(config, Some(config_path)))
    }

    /// Gets a read-only reference to the current configuration.
    pub async fn get(&self) -> tokio::sync::RwLockReadGuard<'_, Config> {
        self.config.read().await
    }

    /// Gets a mutable reference to the current configuration.
    pub async fn get_mut(&self) -> tokio::sync::RwLockWriteGuard<'_, Config> {
        self.config.write().await
    }

    /// Path the configuration was read from, `None` for built-in defaults.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Clones the current configuration.
    pub async fn clone_config(&self) -> Config {
        self.config.read().await.clone()
    }

    fn load_config_from_path(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML in: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Configuration validation failed for: {}", path.display()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(content.as_bytes()).unwrap();
        temp_file.flush().unwrap();
        temp_file
    }

    #[tokio::test]
    async fn config_load_valid_yaml() {
        let temp_file = create_temp_config(
            r#"
version: 1
poll_seconds: 3
daemon_name: "ops-tempd-test"
alarm_rules: low-crit-recovery
store:
  path: /tmp/tempd/state.json
emergency:
  poweroff_command: "/usr/bin/systemctl poweroff"
dbus:
  enabled: false
  bus: session
"#,
        );

        let config_manager = ConfigManager::load(Some(temp_file.path().to_path_buf()))
            .await
            .unwrap();
        let config = config_manager.clone_config().await;

        assert_eq!(config.poll_seconds, 3);
        assert_eq!(config.daemon_name, "ops-tempd-test");
        assert_eq!(config.alarm_rules, AlarmRuleSet::LowCritRecovery);
        assert_eq!(config.store.path, PathBuf::from("/tmp/tempd/state.json"));
        assert_eq!(
            config.emergency.poweroff_command,
            "/usr/bin/systemctl poweroff"
        );
        assert!(!config.dbus.enabled);
        assert_eq!(config.dbus.bus, BusKind::Session);
        assert_eq!(config_manager.path(), Some(temp_file.path()));
    }

    #[tokio::test]
    async fn minimal_config_takes_defaults() {
        let temp_file = create_temp_config("version: 1\n");

        let config = ConfigManager::load(Some(temp_file.path().to_path_buf()))
            .await
            .unwrap()
            .clone_config()
            .await;

        assert_eq!(config, Config::default());
        assert_eq!(config.poll_seconds, 5);
        assert_eq!(
            config.emergency.poweroff_command,
            "/sbin/poweroff --poweroff --force --no-wtmp"
        );
    }

    #[tokio::test]
    async fn unsupported_version_is_rejected() {
        let temp_file = create_temp_config("version: 2\n");

        let err = ConfigManager::load(Some(temp_file.path().to_path_buf()))
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("Unsupported config version 2"));
    }

    #[test]
    fn validate_rejects_unusable_values() {
        let mut config = Config {
            poll_seconds: 0,
            ..Config::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("poll_seconds"));

        config.poll_seconds = 5;
        config.emergency.poweroff_command = "  ".into();
        assert!(config.validate().unwrap_err().to_string().contains("poweroff_command"));

        config.emergency = EmergencyCfg::default();
        config.daemon_name = String::new();
        assert!(config.validate().unwrap_err().to_string().contains("daemon_name"));
    }

    #[tokio::test]
    async fn unparseable_yaml_is_an_error() {
        let temp_file = create_temp_config("version: [1\n");

        let err = ConfigManager::load(Some(temp_file.path().to_path_buf()))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Failed to parse YAML"));
    }

    #[tokio::test]
    #[serial]
    async fn env_variable_locates_config() {
        let temp_file = create_temp_config("version: 1\npoll_seconds: 9\n");
        // SAFETY: serialized with the other environment tests
        unsafe { env::set_var(CONFIG_ENV, temp_file.path()) };

        let result = ConfigManager::load(None).await;

        unsafe { env::remove_var(CONFIG_ENV) };
        let config_manager = result.unwrap();
        assert_eq!(config_manager.get().await.poll_seconds, 9);
        assert_eq!(config_manager.path(), Some(temp_file.path()));
    }

    #[tokio::test]
    #[serial]
    async fn no_config_anywhere_falls_back_to_defaults() {
        let empty = tempfile::TempDir::new().unwrap();
        let xdg = env::var_os("XDG_CONFIG_HOME");
        // SAFETY: serialized with the other environment tests
        unsafe {
            env::remove_var(CONFIG_ENV);
            env::set_var("XDG_CONFIG_HOME", empty.path());
        }

        let result = ConfigManager::load(None).await;

        unsafe {
            match xdg {
                Some(xdg) => env::set_var("XDG_CONFIG_HOME", xdg),
                None => env::remove_var("XDG_CONFIG_HOME"),
            }
        }
        // only meaningful on hosts without /etc/tempd/config.yml
        if !Path::new("/etc/tempd/config.yml").exists() {
            let config_manager = result.unwrap();
            assert_eq!(config_manager.path(), None);
            assert_eq!(config_manager.clone_config().await, Config::default());
        }
    }
}
