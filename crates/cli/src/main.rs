mod cmd;
mod util;

use std::path::PathBuf;

use anyhow::Result;
use argp::FromArgs;
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Watch GitHub Actions workflow runs and report status changes.
struct TopLevel {
    #[argp(option, short = 'c', from_str_fn(util::path_buf))]
    /// config file path (default: config.yml)
    config: Option<PathBuf>,
    #[argp(subcommand)]
    command: Command,
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
#[argp(subcommand)]
enum Command {
    Watch(cmd::watch::Args),
    Status(cmd::status::Args),
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::builder()
        // Default to info level
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let args: TopLevel = argp::parse_args_or_exit(argp::DEFAULT);
    let config_path = args.config.unwrap_or_else(|| PathBuf::from("config.yml"));
    match args.command {
        Command::Watch(args) => cmd::watch::run(&config_path, args).await,
        Command::Status(args) => cmd::status::run(&config_path, args).await,
    }
}
