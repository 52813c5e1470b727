use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use runwatch_core::{
    GatewayError,
    config::SyncConfig,
    models::{RunSnapshot, WatchedWorkflow},
};
use runwatch_github::ActionsGateway;
use tokio::sync::broadcast;

use crate::{
    cache::{StatusCache, StatusChange},
    fetch::fetch_statuses,
    scheduler::RefreshScheduler,
};

/// Composition root of the synchronization engine.
///
/// Owns the snapshot cache, the watch set, and a [`RefreshScheduler`]
/// whose cycles fetch the currently watched workflows and merge the
/// results. Consumers subscribe to a change channel that fires once
/// per key whose merged value actually changed, never on a poll that
/// found nothing new.
pub struct StatusWatcher {
    shared: Arc<Shared>,
    scheduler: RefreshScheduler,
}

struct Shared {
    gateway: Arc<dyn ActionsGateway>,
    cache: Arc<StatusCache>,
    watched: RwLock<HashSet<WatchedWorkflow>>,
    changes: broadcast::Sender<StatusChange>,
    observers: AtomicUsize,
    signed_out: AtomicBool,
    last_error: Mutex<Option<String>>,
    config: SyncConfig,
}

impl StatusWatcher {
    pub fn new(
        gateway: Arc<dyn ActionsGateway>,
        cache: Arc<StatusCache>,
        config: SyncConfig,
    ) -> Self {
        let (changes, _) = broadcast::channel(256);
        let shared = Arc::new(Shared {
            gateway,
            cache,
            watched: RwLock::new(HashSet::new()),
            changes,
            observers: AtomicUsize::new(0),
            signed_out: AtomicBool::new(false),
            last_error: Mutex::new(None),
            config,
        });
        let cycle_shared = Arc::clone(&shared);
        let scheduler =
            RefreshScheduler::new(move || run_cycle(Arc::clone(&cycle_shared)));
        Self { shared, scheduler }
    }

    /// Add a workflow to the watch set. Callers typically follow up
    /// with [`refresh_now`](Self::refresh_now) so the new entry is
    /// populated without waiting for the polling cadence.
    pub fn watch(&self, key: WatchedWorkflow) {
        self.shared.watched.write().unwrap().insert(key);
    }

    /// Remove a workflow from the watch set and drop its snapshot.
    pub fn unwatch(&self, key: &WatchedWorkflow) {
        self.shared.watched.write().unwrap().remove(key);
        if self.shared.cache.remove(key).is_some() {
            self.shared.cache.persist();
        }
    }

    pub fn watched(&self) -> Vec<WatchedWorkflow> {
        self.shared.watched.read().unwrap().iter().cloned().collect()
    }

    pub fn snapshot(&self, key: &WatchedWorkflow) -> Option<RunSnapshot> {
        self.shared.cache.get(key)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.shared.changes.subscribe()
    }

    /// Begin background polling.
    pub fn start(&self) { self.scheduler.start() }

    /// Refresh every watched workflow now, sharing the in-flight cycle
    /// if one is already running.
    pub async fn refresh_all(&self) { self.scheduler.run().await }

    /// Refresh a subset directly, bypassing the polling cadence. Used
    /// after adding a watch so its status shows up immediately.
    pub async fn refresh_now(&self, keys: &[WatchedWorkflow]) -> Result<(), GatewayError> {
        let mut changed = false;
        let outcome = fetch_statuses(&self.shared.gateway, keys, |snapshot| {
            changed |= merge_snapshot(&self.shared, snapshot);
        })
        .await;
        if changed {
            self.shared.cache.persist();
        }
        match outcome {
            Ok(_) => {
                record_success(&self.shared);
                Ok(())
            }
            Err(e) => {
                record_failure(&self.shared, &e);
                Err(e)
            }
        }
    }

    /// Stop polling and abort any in-flight cycle.
    pub async fn cancel(&self) { self.scheduler.cancel().await }

    /// Whether a background cycle is scheduled.
    pub async fn is_scheduled(&self) -> bool { self.scheduler.is_scheduled().await }

    /// Hold the returned guard while a surface is actively presenting
    /// statuses; polling runs at the foreground cadence as long as at
    /// least one guard is alive. Takes effect from the next cycle.
    pub fn observe(&self) -> ObserverGuard {
        self.shared.observers.fetch_add(1, Ordering::SeqCst);
        ObserverGuard { shared: Arc::clone(&self.shared) }
    }

    /// The last refresh failure, if the most recent cycle failed.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().unwrap().clone()
    }

    /// True after a cycle hit HTTP 401. Polling stops until the caller
    /// re-authenticates and explicitly refreshes.
    pub fn signed_out(&self) -> bool { self.shared.signed_out.load(Ordering::SeqCst) }
}

/// Keeps the watcher in foreground cadence while alive.
pub struct ObserverGuard {
    shared: Arc<Shared>,
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        self.shared.observers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Merge one fetched snapshot, returning whether anything changed.
/// Results for keys that were unwatched while the fetch was in flight
/// are dropped rather than re-inserted.
fn merge_snapshot(shared: &Shared, snapshot: &RunSnapshot) -> bool {
    if !shared.watched.read().unwrap().contains(&snapshot.key) {
        tracing::debug!("Dropping result for unwatched workflow {}", snapshot.key);
        return false;
    }
    match shared.cache.merge(snapshot.clone()) {
        Some(change) => {
            tracing::info!(
                "{} changed: {} -> {}",
                change.key,
                change.previous.as_ref().map_or("(none)", |p| p.state.as_str()),
                change.current.state
            );
            let _ = shared.changes.send(change);
            true
        }
        None => false,
    }
}

fn record_success(shared: &Shared) {
    shared.signed_out.store(false, Ordering::SeqCst);
    *shared.last_error.lock().unwrap() = None;
}

fn record_failure(shared: &Shared, error: &GatewayError) {
    if error.is_unauthorized() {
        shared.signed_out.store(true, Ordering::SeqCst);
    }
    *shared.last_error.lock().unwrap() = Some(error.to_string());
}

fn next_interval(shared: &Shared) -> Duration {
    if shared.observers.load(Ordering::SeqCst) > 0 {
        shared.config.foreground_interval()
    } else {
        shared.config.background_interval()
    }
}

/// One scheduled refresh cycle. Failed cycles keep previously cached
/// snapshots and pick the retry cadence; an unauthorized cycle stops
/// the scheduler entirely.
async fn run_cycle(shared: Arc<Shared>) -> Option<Duration> {
    let keys: Vec<WatchedWorkflow> =
        shared.watched.read().unwrap().iter().cloned().collect();
    if keys.is_empty() {
        return Some(next_interval(&shared));
    }

    let mut changed = false;
    let outcome = fetch_statuses(&shared.gateway, &keys, |snapshot| {
        changed |= merge_snapshot(&shared, snapshot);
    })
    .await;
    if changed {
        shared.cache.persist();
    }

    match outcome {
        Ok(results) => {
            tracing::debug!("Refreshed {} workflows (changed: {changed})", results.len());
            record_success(&shared);
            Some(next_interval(&shared))
        }
        Err(e) if e.is_unauthorized() => {
            tracing::warn!("Refresh unauthorized; pausing until re-authentication");
            record_failure(&shared, &e);
            None
        }
        Err(e) => {
            tracing::warn!("Refresh failed, retrying on backoff cadence: {e}");
            record_failure(&shared, &e);
            Some(shared.config.retry_interval())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Mutex as StdMutex};

    use async_trait::async_trait;
    use runwatch_core::models::{JobSnapshot, RunState, WorkflowRun};

    use super::*;

    /// Serves a scripted sequence of "list runs" responses, one entry
    /// per refresh cycle; the last entry repeats.
    struct ScriptedGateway {
        script: Vec<HashMap<String, Vec<WorkflowRun>>>,
        cursor: StdMutex<usize>,
        fail_with: StdMutex<Option<fn() -> GatewayError>>,
    }

    impl ScriptedGateway {
        fn new(script: Vec<HashMap<String, Vec<WorkflowRun>>>) -> Self {
            Self { script, cursor: StdMutex::new(0), fail_with: StdMutex::new(None) }
        }

        fn fail_with(&self, make: fn() -> GatewayError) {
            *self.fail_with.lock().unwrap() = Some(make);
        }

        fn advance(&self) {
            let mut cursor = self.cursor.lock().unwrap();
            if *cursor + 1 < self.script.len() {
                *cursor += 1;
            }
        }
    }

    #[async_trait]
    impl ActionsGateway for ScriptedGateway {
        async fn list_runs(
            &self,
            repository: &str,
            page: u32,
            _per_page: u8,
        ) -> Result<Vec<WorkflowRun>, GatewayError> {
            if let Some(make) = *self.fail_with.lock().unwrap() {
                return Err(make());
            }
            if page > 1 {
                return Ok(Vec::new());
            }
            let cursor = *self.cursor.lock().unwrap();
            Ok(self.script[cursor].get(repository).cloned().unwrap_or_default())
        }

        async fn list_jobs(
            &self,
            _repository: &str,
            _run_id: u64,
        ) -> Result<Vec<JobSnapshot>, GatewayError> {
            Ok(Vec::new())
        }

        async fn list_annotations(
            &self,
            _repository: &str,
            _job_id: u64,
        ) -> Result<Vec<runwatch_core::models::CheckAnnotation>, GatewayError> {
            Ok(Vec::new())
        }
    }

    fn key() -> WatchedWorkflow { WatchedWorkflow::new("a/b", 7, "main") }

    fn run_99() -> WorkflowRun {
        WorkflowRun {
            id: 99,
            workflow_id: 7,
            head_branch: "main".to_string(),
            state: RunState::Success,
            created_at: None,
            updated_at: None,
            head_sha: Some("abc123".to_string()),
            display_title: None,
            html_url: None,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<StatusChange>) -> Vec<StatusChange> {
        let mut events = Vec::new();
        while let Ok(change) = rx.try_recv() {
            events.push(change);
        }
        events
    }

    #[tokio::test]
    async fn change_events_fire_only_on_true_transitions() {
        // Cycle 1: no runs. Cycle 2: run 99. Cycle 3: identical run 99.
        let gateway = Arc::new(ScriptedGateway::new(vec![
            HashMap::new(),
            HashMap::from([("a/b".to_string(), vec![run_99()])]),
            HashMap::from([("a/b".to_string(), vec![run_99()])]),
        ]));
        let watcher = StatusWatcher::new(
            gateway.clone(),
            Arc::new(StatusCache::in_memory()),
            SyncConfig::default(),
        );
        watcher.watch(key());
        let mut rx = watcher.subscribe();

        watcher.refresh_all().await;
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].current.state, RunState::Unknown);
        assert!(watcher.snapshot(&key()).unwrap().created_at.is_none());

        gateway.advance();
        watcher.refresh_all().await;
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].previous.as_ref().unwrap().state, RunState::Unknown);
        assert_eq!(events[0].current.state, RunState::Success);
        assert_eq!(watcher.snapshot(&key()).unwrap().run_id, Some(99));

        gateway.advance();
        watcher.refresh_all().await;
        assert!(drain(&mut rx).is_empty());
        assert_eq!(watcher.snapshot(&key()).unwrap().run_id, Some(99));
    }

    #[tokio::test]
    async fn results_for_unwatched_keys_are_dropped() {
        let gateway = Arc::new(ScriptedGateway::new(vec![HashMap::from([(
            "a/b".to_string(),
            vec![run_99()],
        )])]));
        let watcher = StatusWatcher::new(
            gateway,
            Arc::new(StatusCache::in_memory()),
            SyncConfig::default(),
        );
        let mut rx = watcher.subscribe();

        // Never watched: the fetch succeeds but the merge drops it.
        watcher.refresh_now(&[key()]).await.unwrap();
        assert!(drain(&mut rx).is_empty());
        assert!(watcher.snapshot(&key()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn observer_guard_switches_cadence() {
        let config = SyncConfig {
            foreground_interval_secs: 10,
            background_interval_secs: 100,
            retry_interval_secs: 5,
            snapshot_path: None,
        };
        let gateway = Arc::new(ScriptedGateway::new(vec![HashMap::new()]));
        let watcher = StatusWatcher::new(
            gateway,
            Arc::new(StatusCache::in_memory()),
            config,
        );
        watcher.watch(key());

        // Background cadence: nothing due at the foreground interval.
        watcher.refresh_all().await;
        assert!(watcher.is_scheduled().await);
        tokio::time::advance(Duration::from_secs(11)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(watcher.is_scheduled().await);

        // With an observer the next cycle arms the short interval.
        let guard = watcher.observe();
        watcher.refresh_all().await;
        tokio::time::advance(Duration::from_secs(11)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        // The timer fired and the follow-up cycle re-armed itself.
        assert!(watcher.is_scheduled().await);
        drop(guard);
        watcher.cancel().await;
    }

    #[tokio::test]
    async fn unauthorized_signs_out_and_stops_polling() {
        let gateway = Arc::new(ScriptedGateway::new(vec![HashMap::new()]));
        gateway.fail_with(|| GatewayError::Unauthorized);
        let watcher = StatusWatcher::new(
            gateway,
            Arc::new(StatusCache::in_memory()),
            SyncConfig::default(),
        );
        watcher.watch(key());

        watcher.refresh_all().await;
        assert!(watcher.signed_out());
        assert!(watcher.last_error().is_some());
        assert!(!watcher.is_scheduled().await);
    }

    #[tokio::test]
    async fn failed_cycle_keeps_cached_snapshots() {
        let gateway = Arc::new(ScriptedGateway::new(vec![HashMap::from([(
            "a/b".to_string(),
            vec![run_99()],
        )])]));
        let watcher = StatusWatcher::new(
            gateway.clone(),
            Arc::new(StatusCache::in_memory()),
            SyncConfig::default(),
        );
        watcher.watch(key());
        watcher.refresh_all().await;
        assert_eq!(watcher.snapshot(&key()).unwrap().run_id, Some(99));

        gateway.fail_with(|| {
            GatewayError::Http(http::StatusCode::INTERNAL_SERVER_ERROR)
        });
        watcher.refresh_all().await;
        assert!(watcher.last_error().is_some());
        assert!(!watcher.signed_out());
        // Stale-but-known data survives a failed cycle, and a retry is armed.
        assert_eq!(watcher.snapshot(&key()).unwrap().run_id, Some(99));
        assert!(watcher.is_scheduled().await);
        watcher.cancel().await;
    }
}
