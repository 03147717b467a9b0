use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};

use crate::{app_context::AppState, providers::traits::ServiceProvider, task_manager::TaskManager};

/// Temperature polling service provider.
///
/// Runs the single [`PollLoop`](crate::poll::PollLoop): reconciliation,
/// sensor reads, emergency checks and state store publishing. It is the
/// core of the daemon, so it starts first and must start.
///
/// # Priority and Criticality
///
/// - **Priority**: 10 (highest)
/// - **Critical**: Yes (system cannot function without it)
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use tempd::providers::PollServiceProvider;
/// use tempd::app_context::AppState;
///
/// # async fn example(state: Arc<AppState>) -> anyhow::Result<()> {
/// let provider = PollServiceProvider::new(state);
/// // Use with TaskManager to start the service
/// # Ok(())
/// # }
/// ```
pub struct PollServiceProvider {
    state: Arc<AppState>,
}

impl PollServiceProvider {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl ServiceProvider for PollServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let (poll, control_rx) = self
            .state
            .take_poll_loop()
            .await
            .ok_or_else(|| anyhow!("Poll loop already running"))?;
        let period = Duration::from_secs(u64::from(self.state.config().await.poll_seconds));

        task_manager
            .spawn_task(self.name().to_string(), move |cancel_token| {
                poll.run(period, control_rx, cancel_token)
            })
            .await
    }

    fn name(&self) -> &'static str {
        "PollService"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn is_critical(&self) -> bool {
        true
    }
}
