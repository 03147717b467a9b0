//! Task management for the daemon's background services.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use log::{error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long a task gets to observe cancellation before shutdown gives up on it.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the spawned service tasks and their cancellation.
///
/// Every task receives a child of [`TaskManager::global_token`], so a single
/// cancel stops all of them.
pub struct TaskManager {
    tasks: HashMap<String, JoinHandle<Result<()>>>,
    pub global_token: CancellationToken,
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            global_token: CancellationToken::new(),
        }
    }

    /// Spawns and registers a task under `name`.
    pub async fn spawn_task<F, Fut>(&mut self, name: String, task_fn: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        if self.tasks.contains_key(&name) {
            return Err(anyhow!("Task '{name}' is already registered"));
        }

        let task_token = self.global_token.child_token();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            info!("Starting task: {task_name}");
            let result = task_fn(task_token).await;
            match &result {
                Ok(()) => info!("Task '{task_name}' completed"),
                Err(e) => error!("Task '{task_name}' failed: {e:#}"),
            }
            result
        });

        self.tasks.insert(name.clone(), handle);
        info!("Task '{name}' spawned");
        Ok(())
    }

    /// Whether the named task has already returned, with or without error.
    ///
    /// Unknown names count as finished.
    pub fn has_finished(&self, name: &str) -> bool {
        self.tasks.get(name).is_none_or(JoinHandle::is_finished)
    }

    /// Cancels every task and waits for them to stop.
    ///
    /// Returns the first failure (error, panic or timeout) encountered.
    pub async fn shutdown_all(&mut self) -> Result<()> {
        info!("Stopping all {} tasks", self.tasks.len());

        self.global_token.cancel();

        let mut first_error = None;
        for (name, handle) in self.tasks.drain() {
            let failure = match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(e))) => {
                    warn!("Task '{name}' failed during shutdown: {e:#}");
                    Some(e.context(format!("Task '{name}' failed")))
                }
                Ok(Err(e)) => {
                    error!("Task '{name}' panicked: {e}");
                    Some(anyhow!("Task '{name}' panicked: {e}"))
                }
                Err(_) => {
                    error!("Task '{name}' did not stop within {SHUTDOWN_TIMEOUT:?}");
                    Some(anyhow!("Task '{name}' shutdown timeout exceeded"))
                }
            };
            if first_error.is_none() {
                first_error = failure;
            }
        }

        match first_error {
            Some(error) => Err(error).context("One or more tasks failed during shutdown"),
            None => {
                info!("All tasks stopped");
                Ok(())
            }
        }
    }

    /// Number of registered tasks.
    #[cfg(test)]
    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    #[cfg(test)]
    pub fn is_running(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn tasks_stop_on_shutdown() {
        let mut task_manager = TaskManager::new();

        for name in ["poll", "audit"] {
            task_manager
                .spawn_task(name.to_string(), |token| async move {
                    token.cancelled().await;
                    Ok(())
                })
                .await
                .unwrap();
        }

        assert_eq!(task_manager.active_count(), 2);
        assert!(!task_manager.has_finished("poll"));

        task_manager.shutdown_all().await.unwrap();
        assert_eq!(task_manager.active_count(), 0);
        assert!(task_manager.global_token.is_cancelled());
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let mut task_manager = TaskManager::new();
        let idle = |token: CancellationToken| async move {
            token.cancelled().await;
            Ok(())
        };

        task_manager.spawn_task("poll".into(), idle).await.unwrap();
        let err = task_manager.spawn_task("poll".into(), idle).await.unwrap_err();

        assert!(err.to_string().contains("already registered"));
        task_manager.shutdown_all().await.unwrap();
    }

    #[tokio::test]
    async fn failed_task_is_reported() {
        let mut task_manager = TaskManager::new();
        task_manager
            .spawn_task("store".into(), |_| async { Err(anyhow!("store vanished")) })
            .await
            .unwrap();

        sleep(Duration::from_millis(50)).await;
        assert!(task_manager.has_finished("store"));
        assert!(task_manager.has_finished("unknown"));

        let err = task_manager.shutdown_all().await.unwrap_err();
        assert!(format!("{err:#}").contains("store vanished"));
    }
}
