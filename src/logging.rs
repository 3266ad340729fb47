use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_ENV: &str = "LEMON3_LOG";
const DEFAULT_DIRECTIVE: &str = "lemon3=info";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sink {
    Stderr,
    /// Used while the terminal is in the alternate screen.
    File(PathBuf),
}

pub fn default_log_file() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("lemon3").join("lemon3.log"))
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Installs the global subscriber. Calling it twice is an error.
pub fn init(sink: Sink) -> Result<()> {
    let registry = tracing_subscriber::registry().with(filter());
    match sink {
        Sink::Stderr => registry
            .with(fmt::layer().compact().with_writer(io::stderr))
            .try_init()
            .context("logging: install subscriber")?,
        Sink::File(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("logging: create directory {}", parent.display())
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("logging: open {}", path.display()))?;
            registry
                .with(
                    fmt::layer()
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                )
                .try_init()
                .context("logging: install subscriber")?
        }
    }
    Ok(())
}
