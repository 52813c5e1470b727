use std::path::Path;

use anyhow::Result;
use argp::FromArgs;
use tokio::{signal, sync::broadcast::error::RecvError};

use crate::util::load_config;

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Poll the configured workflows and print every status change.
#[argp(subcommand, name = "watch")]
pub struct Args {}

pub async fn run(config_path: &Path, _args: Args) -> Result<()> {
    let config = load_config(config_path)?;
    let watcher = super::build_watcher(&config).await?;
    let mut changes = watcher.subscribe();

    // Populate the cache before settling into the polling cadence.
    watcher.refresh_all().await;
    if watcher.signed_out() {
        anyhow::bail!("GitHub rejected the configured token");
    }
    for key in watcher.watched() {
        if let Some(snapshot) = watcher.snapshot(&key) {
            tracing::info!("{key}: {}", snapshot.state);
        }
    }

    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Ok(change) => {
                    let title = change.current.commit_title.as_deref().unwrap_or("(no title)");
                    println!("{}: {} ({title})", change.key, change.current.state);
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("Dropped {missed} change events");
                }
                Err(RecvError::Closed) => break,
            },
            _ = signal::ctrl_c() => break,
        }
    }
    watcher.cancel().await;
    Ok(())
}
