//! Service construction for CLI commands.
//!
//! Configuration comes from `--config`, else `~/.config/taskline/config.toml`
//! when present, else `TASKLINE__*` environment variables alone.

use anyhow::{Context, Result};
use std::path::PathBuf;

use taskline_core::{config::Config, jobs::JobRegistry, Taskline};

fn default_config_path() -> Option<PathBuf> {
    let path = dirs::config_dir()?.join("taskline").join("config.toml");
    path.exists().then_some(path)
}

pub fn load_config(explicit: Option<&str>) -> Result<Config> {
    let config = match explicit {
        Some(path) => Config::from_file(path).with_context(|| format!("Failed to load config from {}", path))?,
        None => match default_config_path() {
            Some(path) => {
                let path = path.to_string_lossy().into_owned();
                Config::from_file(&path).with_context(|| format!("Failed to load config from {}", path))?
            }
            None => Config::load().context("Failed to load config from the environment")?,
        },
    };
    Ok(config)
}

pub async fn connect(explicit: Option<&str>) -> Result<Taskline> {
    let config = load_config(explicit)?;
    Taskline::connect(config, JobRegistry::with_builtins())
        .await
        .context("Failed to connect Taskline backends")
}
