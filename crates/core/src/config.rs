use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::models::WatchedWorkflow;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub github: GitHubConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    /// Workflows to watch at startup.
    #[serde(default)]
    pub watch: Vec<WatchedWorkflow>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubConfig {
    pub token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between refresh cycles while at least one observer is
    /// actively watching for updates.
    pub foreground_interval_secs: u64,
    /// Seconds between refresh cycles with no active observers.
    pub background_interval_secs: u64,
    /// Seconds before retrying after a failed cycle.
    pub retry_interval_secs: u64,
    /// Where to persist the last-known snapshots, if anywhere.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            foreground_interval_secs: 60,
            background_interval_secs: 300,
            retry_interval_secs: 30,
            snapshot_path: None,
        }
    }
}

impl SyncConfig {
    pub fn foreground_interval(&self) -> Duration {
        Duration::from_secs(self.foreground_interval_secs)
    }

    pub fn background_interval(&self) -> Duration {
        Duration::from_secs(self.background_interval_secs)
    }

    pub fn retry_interval(&self) -> Duration { Duration::from_secs(self.retry_interval_secs) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_defaults_apply() {
        let config: SyncConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.foreground_interval(), Duration::from_secs(60));
        assert_eq!(config.background_interval(), Duration::from_secs(300));
        assert_eq!(config.retry_interval(), Duration::from_secs(30));
        assert!(config.snapshot_path.is_none());
    }
}
