use anyhow::{Result, anyhow};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use notify::{Event, EventHandler, RecursiveMode, Watcher, recommended_watcher};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    event::{Event as AppEvent, EventBus},
    providers::traits::ServiceProvider,
    task_manager::TaskManager,
};

/// Quiet period before a burst of store writes becomes one wake-up.
const DEBOUNCE: Duration = Duration::from_millis(500);

/// State store file monitoring service provider.
///
/// Watches the state store document and publishes
/// [`Event::StoreChanged`](crate::event::Event::StoreChanged) so the poll
/// loop can pick up subsystem changes without waiting for its next tick.
///
/// # Priority and Criticality
///
/// - **Priority**: 6 (medium)
/// - **Critical**: No (polling still sees every change, only later)
///
/// # Implementation
///
/// The watcher follows the store's parent directory rather than the file:
/// the store is replaced by rename on every commit, which would orphan a
/// watch on the file itself. Events are filtered by file name and
/// debounced.
pub struct StoreWatcherServiceProvider {
    store_path: PathBuf,
    event_bus: EventBus,
}

impl StoreWatcherServiceProvider {
    pub fn new(store_path: PathBuf, event_bus: EventBus) -> Self {
        Self {
            store_path,
            event_bus,
        }
    }
}

#[async_trait]
impl ServiceProvider for StoreWatcherServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let store_path = self.store_path.clone();
        let event_bus = self.event_bus.clone();

        task_manager
            .spawn_task(self.name().to_string(), |cancel_token| async move {
                run_store_watcher_service(store_path, event_bus, cancel_token).await
            })
            .await
    }

    fn name(&self) -> &'static str {
        "StoreWatcherService"
    }

    fn priority(&self) -> i32 {
        6
    }

    fn is_critical(&self) -> bool {
        false
    }
}

/// Forwards notify callbacks into the async side.
#[derive(Debug)]
struct AsyncEventHandler {
    sender: mpsc::UnboundedSender<notify::Result<Event>>,
}

impl EventHandler for AsyncEventHandler {
    fn handle_event(&mut self, event: notify::Result<Event>) {
        if let Err(e) = self.sender.send(event) {
            error!("Failed to forward filesystem event: {e}");
        }
    }
}

fn affects_store(event: &Event, store_path: &Path) -> bool {
    let relevant = event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove();
    relevant
        && event
            .paths
            .iter()
            .any(|path| path == store_path || path.file_name() == store_path.file_name())
}

async fn run_store_watcher_service(
    store_path: PathBuf,
    event_bus: EventBus,
    cancel_token: CancellationToken,
) -> Result<()> {
    let watch_dir = store_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut watcher = recommended_watcher(AsyncEventHandler { sender: event_tx })?;
    watcher
        .watch(&watch_dir, RecursiveMode::NonRecursive)
        .map_err(|e| anyhow!("Failed to watch {}: {e}", watch_dir.display()))?;
    info!("Watching state store {}", store_path.display());

    let mut debounce_interval = tokio::time::interval(DEBOUNCE);
    debounce_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut has_pending_event = false;

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("Store watcher service cancelled");
                break;
            }

            event_result = event_rx.recv() => {
                match event_result {
                    Some(Ok(event)) => {
                        if affects_store(&event, &store_path) {
                            debug!("State store touched: {:?}", event.kind);
                            if !has_pending_event {
                                debounce_interval.reset();
                            }
                            has_pending_event = true;
                        }
                    }
                    Some(Err(e)) => warn!("Filesystem watcher error: {e}"),
                    None => {
                        warn!("Filesystem event channel closed, exiting");
                        break;
                    }
                }
            }

            _ = debounce_interval.tick(), if has_pending_event => {
                has_pending_event = false;
                event_bus.emit(AppEvent::StoreChanged);
            }
        }
    }

    if let Err(e) = watcher.unwatch(&watch_dir) {
        warn!("Failed to unwatch {}: {e}", watch_dir.display());
    }

    info!("Store watcher service stopped");
    Ok(())
}
