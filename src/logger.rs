use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

/// Where the logs go and how verbose they are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub log_level: String,
    pub log_file: PathBuf,
    pub event_file: PathBuf,
}

impl LogConfig {
    pub fn new(root: &Path, log_file: &str, event_file: &str, log_level: &str) -> Self {
        Self {
            log_level: log_level.to_string(),
            log_file: root.join(log_file),
            event_file: root.join(event_file),
        }
    }
}

/// Install the global subscriber:
///
/// - a plain-text daily-rolling log with everything `log_level` lets through
/// - a newline-delimited JSON daily-rolling log holding only the `turn` reports
///   the engine emits once per handled message
pub fn init_tracing(root: PathBuf, log_file: String, event_file: String, log_level: String) -> Result<()> {
    let config = LogConfig::new(&root, &log_file, &event_file, &log_level);
    let env_filter = EnvFilter::try_new(&config.log_level)
        .with_context(|| format!("invalid log level `{}`", config.log_level))?;

    let (txt_dir, txt_name) = split(&config.log_file)?;
    let txt_appender = RollingFileAppender::new(Rotation::DAILY, txt_dir, txt_name);
    let txt_layer = fmt::Layer::default()
        .with_writer(txt_appender)
        .with_ansi(false)
        .with_filter(env_filter);

    let (json_dir, json_name) = split(&config.event_file)?;
    let json_appender = RollingFileAppender::new(Rotation::DAILY, json_dir, json_name);
    let json_layer = fmt::layer()
        .json()
        .with_writer(json_appender)
        .with_target(true)
        .with_filter(EnvFilter::new("turn=info"));

    Registry::default()
        .with(txt_layer)
        .with(json_layer)
        .try_init()
        .context("a tracing subscriber is already installed")?;
    Ok(())
}

fn split(path: &Path) -> Result<(PathBuf, PathBuf)> {
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let name = path
        .file_name()
        .map(PathBuf::from)
        .with_context(|| format!("log path `{}` has no file name", path.display()))?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("could not create log directory `{}`", dir.display()))?;
    Ok((dir, name))
}
