use std::{fs::File, io::BufReader, path::{Path, PathBuf}};

use anyhow::{Context, Result};
use runwatch_core::config::Config;

// For argp::FromArgs
pub fn path_buf(value: &str) -> Result<PathBuf, String> { Ok(PathBuf::from(value)) }

pub fn load_config(path: &Path) -> Result<Config> {
    let file = BufReader::new(
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
    );
    serde_yaml::from_reader(file)
        .with_context(|| format!("Failed to parse {}", path.display()))
}
