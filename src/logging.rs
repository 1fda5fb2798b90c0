//! Tracing setup for the command-line shell.
//!
//! Events go to stderr and are appended to `<data_dir>/stagehand.log`.
//! `STAGEHAND_LOG` takes an `EnvFilter` directive and overrides the
//! verbosity passed in.

use anyhow::{Context, Result};
use std::{fs, path::Path, sync::Mutex};
use tracing_subscriber::{
    fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter,
};

pub const LOG_ENV: &str = "STAGEHAND_LOG";
pub const LOG_FILE: &str = "stagehand.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Verbose,
}

impl Verbosity {
    fn directive(self) -> &'static str {
        match self {
            Verbosity::Quiet => "warn",
            Verbosity::Normal => "info",
            Verbosity::Verbose => "debug",
        }
    }
}

pub fn init(data_dir: &Path, verbosity: Verbosity) -> Result<()> {
    fs::create_dir_all(data_dir).context("create data dir")?;
    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(data_dir.join(LOG_FILE))
        .context("open log file")?;

    tracing_subscriber::registry()
        .with(filter(verbosity))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .with(
            fmt::layer()
                .with_writer(Mutex::new(log_file))
                .with_ansi(false),
        )
        .try_init()
        .context("install tracing subscriber")?;
    Ok(())
}

fn filter(verbosity: Verbosity) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(verbosity.directive()))
}
