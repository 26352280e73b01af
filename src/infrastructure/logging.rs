//! Logging system configuration and initialization
//!
//! - File logging with rotation of the previous run's log
//! - Configuration based log level control and dependency noise suppression
//! - Structured JSON file logs (optional)
//! - Console and file output support
//! - Local timezone timestamps

#![allow(clippy::uninlined_format_args)]

use anyhow::{Result, anyhow};
use chrono::{DateTime, Local};
use lazy_static::lazy_static;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub use crate::infrastructure::config::LoggingConfig;
use crate::infrastructure::config::defaults;

// Keeps the non-blocking writers flushing for the life of the process
lazy_static! {
    static ref LOG_GUARDS: Mutex<Vec<tracing_appender::non_blocking::WorkerGuard>> =
        Mutex::new(Vec::new());
}

/// Timestamps in the machine's local timezone
struct LocalTimeFormatter;

impl FormatTime for LocalTimeFormatter {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S%.3f %:z"))
    }
}

/// Log directory: configured, or `<data dir>/logs`
#[must_use]
pub fn get_log_directory(config: &LoggingConfig) -> PathBuf {
    config
        .directory
        .clone()
        .unwrap_or_else(|| defaults::app_data_dir().join("logs"))
}

/// Initialize the logging system with default configuration
pub fn init_logging() -> Result<()> {
    init_logging_with_config(LoggingConfig::default())
}

/// Rename the previous run's log file with its timestamp
fn rotate_existing_log_file(log_dir: &Path, log_file_name: &str) -> Result<Option<PathBuf>> {
    let log_file_path = log_dir.join(log_file_name);
    if !log_file_path.exists() {
        return Ok(None);
    }

    let metadata = std::fs::metadata(&log_file_path)
        .map_err(|e| anyhow!("Failed to get log file metadata: {}", e))?;
    let file_time = metadata
        .modified()
        .or_else(|_| metadata.created())
        .unwrap_or_else(|_| std::time::SystemTime::now());
    let datetime: DateTime<Local> = file_time.into();

    let file_stem = log_file_name.trim_end_matches(".log");
    let timestamped_name = format!("{}.{}.log", file_stem, datetime.format("%Y%m%dT%H%M%S"));
    let timestamped_path = log_dir.join(&timestamped_name);

    std::fs::rename(&log_file_path, &timestamped_path).map_err(|e| {
        anyhow!(
            "Failed to rotate log file {} to {}: {}",
            log_file_path.display(),
            timestamped_path.display(),
            e
        )
    })?;

    Ok(Some(timestamped_path))
}

/// Build the filter from `RUST_LOG`, or from the configured level plus
/// dependency directives when the variable is unset
fn build_env_filter(config: &LoggingConfig) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let mut filter = EnvFilter::new(&config.level);
    if config.level.to_lowercase().contains("trace") {
        return filter;
    }

    let crate_directive = format!("{}={}", env!("CARGO_CRATE_NAME"), config.level);
    let directives = config
        .module_filters
        .iter()
        .map(|(module, level)| format!("{module}={level}"))
        .chain(std::iter::once(crate_directive));

    for directive in directives {
        match directive.parse() {
            Ok(parsed) => filter = filter.add_directive(parsed),
            Err(e) => eprintln!("Ignoring invalid log directive {directive:?}: {e}"),
        }
    }
    filter
}

/// Initialize logging with custom configuration
///
/// Dependency output (`reqwest`, `hyper`, `h2`, `tokio`) is held back to the
/// levels in `module_filters` unless the level is `trace`. `RUST_LOG`
/// overrides everything:
/// ```bash
/// RUST_LOG="debug,reqwest=debug,hyper=debug" cargo test
/// ```
pub fn init_logging_with_config(config: LoggingConfig) -> Result<()> {
    if !config.file_output && !config.console_output {
        return Err(anyhow!("No logging output configured"));
    }

    let log_dir = get_log_directory(&config);
    let mut rotated = None;
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.file_output {
        std::fs::create_dir_all(&log_dir)
            .map_err(|e| anyhow!("Failed to create log directory {:?}: {}", log_dir, e))?;

        rotated = rotate_existing_log_file(&log_dir, &config.file_name)?;
        if config.auto_cleanup_logs {
            cleanup_old_logs(&log_dir, &config)?;
        }

        let file_appender = rolling::never(&log_dir, &config.file_name);
        let (file_writer, file_guard) = non_blocking(file_appender);
        if let Ok(mut guards) = LOG_GUARDS.lock() {
            guards.push(file_guard);
        }

        let file_layer = if config.json_format {
            fmt::Layer::new()
                .json()
                .with_writer(file_writer)
                .with_timer(LocalTimeFormatter)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .boxed()
        } else {
            fmt::Layer::new()
                .with_writer(file_writer)
                .with_timer(LocalTimeFormatter)
                .with_target(false)
                .with_ansi(false)
                .boxed()
        };
        layers.push(file_layer);
    }

    if config.console_output {
        layers.push(
            fmt::Layer::new()
                .with_writer(std::io::stdout)
                .with_timer(LocalTimeFormatter)
                .with_target(false)
                .boxed(),
        );
    }

    Registry::default()
        .with(layers)
        .with(build_env_filter(&config))
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;

    info!("Logging system initialized");
    info!("Log directory: {:?}", log_dir);
    info!("Log level: {}", config.level);
    info!("JSON format: {}", config.json_format);
    info!("Console output: {}, file output: {}", config.console_output, config.file_output);
    if let Some(path) = rotated {
        info!("Rotated previous log file to: {:?}", path);
    }

    Ok(())
}

/// Delete the oldest `.log` files beyond `max_files`
fn cleanup_old_logs(log_dir: &Path, config: &LoggingConfig) -> Result<usize> {
    if !log_dir.exists() {
        return Ok(0);
    }

    let mut log_files = Vec::new();
    for entry in std::fs::read_dir(log_dir)? {
        let path = entry?.path();
        let is_log = path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".log"));
        if !is_log {
            continue;
        }
        if let Ok(modified) = std::fs::metadata(&path).and_then(|m| m.modified()) {
            log_files.push((path, modified));
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let keep = config.max_files as usize;
    let mut removed = 0;
    for (path, _) in log_files.iter().skip(keep) {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Failed to remove old log file {:?}: {}", path, e);
        } else {
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_logging_config_default() {
        let config = LoggingConfig::default();
        assert!(!config.level.is_empty());
        assert!(config.console_output);
        assert!(config.file_output);
        assert_eq!(config.module_filters.get("hyper").map(String::as_str), Some("warn"));
    }

    #[test]
    fn test_log_directory_defaults_to_logs() {
        let config = LoggingConfig::default();
        assert!(get_log_directory(&config).ends_with("logs"));

        let custom = LoggingConfig {
            directory: Some(PathBuf::from("/tmp/custom-logs")),
            ..LoggingConfig::default()
        };
        assert_eq!(get_log_directory(&custom), PathBuf::from("/tmp/custom-logs"));
    }

    #[test]
    fn test_rotation_renames_previous_log() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("sync.log"), "previous run").unwrap();

        let rotated = rotate_existing_log_file(dir.path(), "sync.log").unwrap().unwrap();
        assert!(!dir.path().join("sync.log").exists());
        assert_eq!(std::fs::read_to_string(&rotated).unwrap(), "previous run");
        let name = rotated.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("sync.") && name.ends_with(".log"));

        assert!(rotate_existing_log_file(dir.path(), "sync.log").unwrap().is_none());
    }

    #[test]
    fn test_cleanup_keeps_max_files() {
        let dir = TempDir::new().unwrap();
        for i in 0..4 {
            std::fs::write(dir.path().join(format!("run{i}.log")), "x").unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "keep me").unwrap();

        let config = LoggingConfig {
            max_files: 2,
            ..LoggingConfig::default()
        };
        assert_eq!(cleanup_old_logs(dir.path(), &config).unwrap(), 2);
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_no_output_is_rejected() {
        let config = LoggingConfig {
            console_output: false,
            file_output: false,
            ..LoggingConfig::default()
        };
        assert!(init_logging_with_config(config).is_err());
    }
}
