pub mod command;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod group;
pub mod job;
pub mod machine;
pub mod parser;
pub mod queue;
pub mod request;
pub mod scan;

use std::path::PathBuf;

/// Hard ceiling on commands launched by one `runs` invocation.
pub const MAX_DISPATCH: usize = 50;

/// GPUs observable per machine; anything beyond is reported, not monitored.
pub const MAX_GPUS_PER_MACHINE: usize = 4;

const VERSION_MESSAGE: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("VERGEN_BUILD_DATE"),
    ")\n",
    "Commit: ",
    env!("VERGEN_GIT_SHA"),
);

pub fn version() -> &'static str {
    let author = clap::crate_authors!();

    Box::leak(Box::new(format!(
        "\
{VERSION_MESSAGE}
Authors: {author}"
    )))
}

pub fn get_config_dir() -> anyhow::Result<PathBuf> {
    dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get config directory"))
        .map(|p| p.join("spg"))
}

pub fn get_data_dir() -> anyhow::Result<PathBuf> {
    dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get data directory"))
        .map(|p| p.join("spg"))
}

pub fn get_log_dir() -> anyhow::Result<PathBuf> {
    let log_dir = get_data_dir()?.join("logs");
    if !log_dir.exists() {
        std::fs::create_dir_all(&log_dir)?;
    }
    Ok(log_dir)
}
