//! Tracing subscriber setup.
//!
//! The filter comes from `RUST_LOG` when set; otherwise `debug` with
//! `--verbose` and `info` without.  Output goes to standard error, or is
//! appended to a log file (without ANSI colours) when one is configured,
//! which is the usual arrangement for a daemonized agent whose stderr
//! points at `/dev/null`.

use std::fs::OpenOptions;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::domain::config::LogConfig;

/// Filter used when `RUST_LOG` is absent or invalid.
pub fn default_filter(config: &LogConfig) -> &'static str {
    if config.verbose {
        "debug"
    } else {
        "info"
    }
}

/// Installs the global subscriber.  Fails if one is already installed or
/// the log file cannot be opened.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(config)));

    let layer = fmt::layer().with_target(false);

    match &config.file {
        None => tracing_subscriber::registry()
            .with(filter)
            .with(layer.with_writer(std::io::stderr))
            .try_init()
            .context("failed to install log subscriber")?,
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(filter)
                .with(layer.with_writer(Mutex::new(file)).with_ansi(false))
                .try_init()
                .context("failed to install log subscriber")?
        }
    }
    Ok(())
}
