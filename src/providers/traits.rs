use anyhow::Result;
use async_trait::async_trait;

use crate::task_manager::TaskManager;

/// Component built asynchronously, e.g. state that needs the config first.
///
/// # Example
///
/// ```no_run
/// use tempd::providers::traits::AsyncProvider;
///
/// struct PollPeriod;
///
/// #[async_trait::async_trait]
/// impl AsyncProvider<u16> for PollPeriod {
///     async fn provide(&self) -> anyhow::Result<u16> {
///         Ok(5)
///     }
/// }
/// ```
#[async_trait]
pub trait AsyncProvider<T> {
    async fn provide(&self) -> Result<T>;
}

/// Service started through the [`TaskManager`].
///
/// Services start in descending priority. A critical service failing to
/// start aborts startup; any other service is skipped with a warning.
///
/// # Example
///
/// ```no_run
/// use tempd::providers::traits::ServiceProvider;
/// use tempd::task_manager::TaskManager;
/// use anyhow::Result;
///
/// struct HeartbeatService;
///
/// #[async_trait::async_trait]
/// impl ServiceProvider for HeartbeatService {
///     async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
///         task_manager.spawn_task("heartbeat".to_string(), |token| async move {
///             token.cancelled().await;
///             Ok(())
///         }).await
///     }
///
///     fn name(&self) -> &'static str { "HeartbeatService" }
/// }
/// ```
#[async_trait]
pub trait ServiceProvider: Send + Sync {
    /// Spawns the service's task(s).
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()>;

    /// Service name for logging and task bookkeeping.
    fn name(&self) -> &'static str;

    /// Startup priority (higher numbers start first).
    fn priority(&self) -> i32 {
        0
    }

    fn is_critical(&self) -> bool {
        false
    }
}
