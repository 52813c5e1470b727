use std::path::Path;

use anyhow::Result;
use argp::FromArgs;

use crate::util::load_config;

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Fetch the current status of every configured workflow once and exit.
#[argp(subcommand, name = "status")]
pub struct Args {}

pub async fn run(config_path: &Path, _args: Args) -> Result<()> {
    let config = load_config(config_path)?;
    let watcher = super::build_watcher(&config).await?;
    let keys = watcher.watched();
    watcher.refresh_now(&keys).await?;
    for key in &keys {
        let Some(snapshot) = watcher.snapshot(key) else {
            continue;
        };
        match &snapshot.run_id {
            Some(run_id) => {
                let failures = snapshot
                    .annotations
                    .iter()
                    .filter(|a| a.level == runwatch_core::models::AnnotationLevel::Failure)
                    .count();
                println!(
                    "{key}: {} (run {run_id}, {} jobs, {failures} failures)",
                    snapshot.state,
                    snapshot.jobs.len()
                );
            }
            None => println!("{key}: no matching runs"),
        }
    }
    Ok(())
}
