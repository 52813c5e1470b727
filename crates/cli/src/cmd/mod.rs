pub mod status;
pub mod watch;

use std::sync::Arc;

use anyhow::{Context, Result};
use runwatch_core::config::Config;
use runwatch_github::GitHubGateway;
use runwatch_sync::{JsonSnapshotStore, SnapshotStore, StatusCache, StatusWatcher};

pub async fn build_watcher(config: &Config) -> Result<StatusWatcher> {
    let gateway = GitHubGateway::new(config.github.token.clone())
        .await
        .context("Failed to create GitHub client")?;
    let store: Option<Box<dyn SnapshotStore>> = config
        .sync
        .snapshot_path
        .clone()
        .map(|path| Box::new(JsonSnapshotStore::new(path)) as Box<dyn SnapshotStore>);
    let cache = Arc::new(StatusCache::new(store));
    let watcher = StatusWatcher::new(Arc::new(gateway), cache, config.sync.clone());
    for key in &config.watch {
        watcher.watch(key.clone());
    }
    Ok(watcher)
}
