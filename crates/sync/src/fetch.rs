use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use http::StatusCode;
use runwatch_core::{
    GatewayError,
    models::{RunSnapshot, WatchedWorkflow, WorkflowRun, dedup_annotations},
};
use runwatch_github::ActionsGateway;
use tokio::{sync::mpsc, task::JoinSet};

/// Runs are listed newest first; 100 is the API's page maximum.
pub const RUNS_PAGE_SIZE: u8 = 100;
/// Hard cap on pages searched per repository. Bounds the worst case
/// for repositories with deep run histories.
pub const MAX_RUN_PAGES: u32 = 9;

/// Produce an enriched [`RunSnapshot`] for every watched workflow.
///
/// Workflows are grouped by repository; groups are fetched
/// concurrently, and one group's failure does not cancel its siblings.
/// `on_item` is invoked on the calling task as each snapshot becomes
/// available, before the full list is returned. If any group failed,
/// the first error is returned after all groups finish, so callbacks
/// may well have fired for unaffected repositories by then.
pub async fn fetch_statuses<F>(
    gateway: &Arc<dyn ActionsGateway>,
    keys: &[WatchedWorkflow],
    mut on_item: F,
) -> Result<Vec<RunSnapshot>, GatewayError>
where
    F: FnMut(&RunSnapshot),
{
    let mut by_repo: HashMap<String, Vec<WatchedWorkflow>> = HashMap::new();
    for key in keys {
        by_repo.entry(key.repository.clone()).or_default().push(key.clone());
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut set = JoinSet::new();
    for (repository, group) in by_repo {
        let gateway = Arc::clone(gateway);
        let tx = tx.clone();
        set.spawn(async move {
            let result = fetch_repository_group(gateway.as_ref(), &repository, group, tx).await;
            (repository, result)
        });
    }
    drop(tx);

    let mut results = Vec::with_capacity(keys.len());
    let mut first_error = None;
    let mut groups_done = false;
    loop {
        tokio::select! {
            snapshot = rx.recv() => match snapshot {
                Some(snapshot) => {
                    on_item(&snapshot);
                    results.push(snapshot);
                }
                // All senders gone, but group results may still be
                // queued in the JoinSet; drain it so a group's error
                // is never lost to this race.
                None => {
                    while let Some(joined) = set.join_next().await {
                        record_group_result(joined, &mut first_error);
                    }
                    break;
                }
            },
            joined = set.join_next(), if !groups_done => match joined {
                Some(joined) => record_group_result(joined, &mut first_error),
                None => groups_done = true,
            },
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(results),
    }
}

fn record_group_result(
    joined: Result<(String, Result<(), GatewayError>), tokio::task::JoinError>,
    first_error: &mut Option<GatewayError>,
) {
    match joined {
        Ok((_, Ok(()))) => {}
        Ok((repository, Err(e))) => {
            tracing::warn!("Failed to fetch statuses for {repository}: {e}");
            first_error.get_or_insert(e);
        }
        Err(e) => {
            tracing::error!("Repository fetch task panicked: {e}");
        }
    }
}

/// Resolve and enrich every watched workflow of one repository,
/// sequentially. An error aborts the remaining items of this
/// repository only.
async fn fetch_repository_group(
    gateway: &dyn ActionsGateway,
    repository: &str,
    keys: Vec<WatchedWorkflow>,
    tx: mpsc::UnboundedSender<RunSnapshot>,
) -> Result<(), GatewayError> {
    let latest = discover_latest_runs(gateway, repository, &keys).await?;
    for key in keys {
        let snapshot = match latest.get(&(key.workflow_id, key.branch.clone())) {
            Some(run) => enrich_run(gateway, &key, run).await?,
            None => RunSnapshot::unknown(key),
        };
        if tx.send(snapshot).is_err() {
            // Receiver gone; the caller stopped listening.
            break;
        }
    }
    Ok(())
}

/// Find the most recent run per sought (workflow, branch) key.
///
/// The API only offers a recency-ordered list of all runs for a
/// repository, so we page through it keeping the first run seen for
/// each sought key. Pages are newest first, so first seen is most
/// recent. The search stops at an empty page, at the page cap, or as
/// soon as every sought key has been resolved; continuing past that
/// point could not change the answer.
async fn discover_latest_runs(
    gateway: &dyn ActionsGateway,
    repository: &str,
    keys: &[WatchedWorkflow],
) -> Result<HashMap<(u64, String), WorkflowRun>, GatewayError> {
    let sought: HashSet<(u64, &str)> =
        keys.iter().map(|k| (k.workflow_id, k.branch.as_str())).collect();
    let mut latest: HashMap<(u64, String), WorkflowRun> = HashMap::new();
    for page in 1..=MAX_RUN_PAGES {
        let runs = match gateway.list_runs(repository, page, RUNS_PAGE_SIZE).await {
            Ok(runs) => runs,
            // A missing repository or disabled Actions reads as "no
            // runs", matching the never-run case.
            Err(GatewayError::Http(StatusCode::NOT_FOUND)) => break,
            Err(e) => return Err(e),
        };
        if runs.is_empty() {
            break;
        }
        for run in runs {
            if !sought.contains(&(run.workflow_id, run.head_branch.as_str())) {
                continue;
            }
            let key = (run.workflow_id, run.head_branch.clone());
            latest.entry(key).or_insert(run);
        }
        if latest.len() == sought.len() {
            break;
        }
        if page == MAX_RUN_PAGES {
            tracing::debug!(
                "{repository}: page cap reached with {} of {} keys resolved",
                latest.len(),
                sought.len()
            );
        }
    }
    Ok(latest)
}

async fn enrich_run(
    gateway: &dyn ActionsGateway,
    key: &WatchedWorkflow,
    run: &WorkflowRun,
) -> Result<RunSnapshot, GatewayError> {
    let jobs = gateway.list_jobs(&key.repository, run.id).await?;
    let mut annotations = Vec::new();
    for job in &jobs {
        annotations.extend(gateway.list_annotations(&key.repository, job.id).await?);
    }
    let mut snapshot = RunSnapshot::from_run(key.clone(), run);
    snapshot.jobs = jobs;
    snapshot.annotations = dedup_annotations(annotations);
    Ok(snapshot)
}
