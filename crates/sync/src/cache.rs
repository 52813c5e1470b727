use std::{
    collections::HashMap,
    fs, io,
    path::PathBuf,
    sync::Mutex,
};

use runwatch_core::models::{RunSnapshot, WatchedWorkflow};

/// One change-detected cache transition, carrying both sides so
/// consumers can render deltas.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub key: WatchedWorkflow,
    pub previous: Option<RunSnapshot>,
    pub current: RunSnapshot,
}

/// Injected persistence for the snapshot cache. The engine only ever
/// sees an in-memory map; where and how it survives restarts is the
/// store's business.
pub trait SnapshotStore: Send + Sync {
    fn load(&self) -> anyhow::Result<Vec<RunSnapshot>>;
    fn save(&self, snapshots: &[RunSnapshot]) -> anyhow::Result<()>;
}

/// File-backed store encoding the snapshots as JSON.
pub struct JsonSnapshotStore {
    path: PathBuf,
}

impl JsonSnapshotStore {
    pub fn new(path: PathBuf) -> Self { Self { path } }
}

impl SnapshotStore for JsonSnapshotStore {
    fn load(&self) -> anyhow::Result<Vec<RunSnapshot>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    fn save(&self, snapshots: &[RunSnapshot]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_vec_pretty(snapshots)?)?;
        Ok(())
    }
}

/// The last-known snapshot per watched workflow.
///
/// Mutated only through [`merge`](Self::merge): a read-then-
/// conditionally-write that reports a [`StatusChange`] exactly when
/// the new value differs structurally from the stored one. Merging
/// the same snapshot twice yields a change at most once.
pub struct StatusCache {
    entries: Mutex<HashMap<WatchedWorkflow, RunSnapshot>>,
    store: Option<Box<dyn SnapshotStore>>,
}

impl StatusCache {
    pub fn new(store: Option<Box<dyn SnapshotStore>>) -> Self {
        let mut entries = HashMap::new();
        if let Some(store) = &store {
            match store.load() {
                Ok(snapshots) => {
                    for snapshot in snapshots {
                        entries.insert(snapshot.key.clone(), snapshot);
                    }
                    tracing::debug!("Loaded {} cached snapshots", entries.len());
                }
                Err(e) => {
                    tracing::warn!("Failed to load cached snapshots, starting empty: {e:?}");
                }
            }
        }
        Self { entries: Mutex::new(entries), store }
    }

    pub fn in_memory() -> Self { Self::new(None) }

    pub fn get(&self, key: &WatchedWorkflow) -> Option<RunSnapshot> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    /// Write the snapshot if it differs from the stored value and
    /// return the transition, or `None` when nothing changed. Atomic
    /// per key: the compare and the write happen under one lock.
    pub fn merge(&self, snapshot: RunSnapshot) -> Option<StatusChange> {
        let mut entries = self.entries.lock().unwrap();
        let previous = entries.get(&snapshot.key);
        if previous == Some(&snapshot) {
            return None;
        }
        let previous = entries.insert(snapshot.key.clone(), snapshot.clone());
        Some(StatusChange { key: snapshot.key.clone(), previous, current: snapshot })
    }

    pub fn remove(&self, key: &WatchedWorkflow) -> Option<RunSnapshot> {
        self.entries.lock().unwrap().remove(key)
    }

    pub fn snapshots(&self) -> Vec<RunSnapshot> {
        self.entries.lock().unwrap().values().cloned().collect()
    }

    /// Save the current contents through the injected store, if any.
    pub fn persist(&self) {
        if let Some(store) = &self.store {
            let snapshots = self.snapshots();
            if let Err(e) = store.save(&snapshots) {
                tracing::warn!("Failed to persist snapshots: {e:?}");
            }
        }
    }
}
