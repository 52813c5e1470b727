pub mod cache;
pub mod fetch;
pub mod scheduler;
pub mod watcher;

pub use cache::{JsonSnapshotStore, SnapshotStore, StatusCache, StatusChange};
pub use scheduler::RefreshScheduler;
pub use watcher::{ObserverGuard, StatusWatcher};
