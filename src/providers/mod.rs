//! Service providers started by the system coordinator.
//!
//! Every long-running part of the daemon is a provider: the poll loop, the
//! D-Bus control surface, the state store watcher and the audit log.

pub mod app_state;
pub mod audit;
pub mod control;
pub mod poll;
pub mod store_watcher;
pub mod traits;

pub use app_state::AppStateProvider;
pub use audit::AuditLogServiceProvider;
pub use control::ControlServiceProvider;
pub use poll::PollServiceProvider;
pub use store_watcher::StoreWatcherServiceProvider;
pub use traits::{AsyncProvider, ServiceProvider};
