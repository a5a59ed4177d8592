pub(crate) mod control;
pub(crate) mod run;

use anyhow::Context;
use hostagent::{clienv, AgentConfig};
use std::path::PathBuf;

/// `--config` wins over the environment and the platform default.
pub(crate) fn load_config(path: Option<PathBuf>) -> anyhow::Result<AgentConfig> {
    let path = path.unwrap_or_else(clienv::config_path);
    AgentConfig::load(&path).with_context(|| format!("Failed to load {}", path.display()))
}
