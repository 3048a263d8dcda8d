//! Structured logging
//!
//! Runtime events and plugin `console` output share one subscriber. Plugin
//! output is logged under the [`PLUGIN_CONSOLE_TARGET`] target with its own
//! level, and the HTTP and engine crates are held at `warn` unless
//! `RUST_LOG` says otherwise.

use crate::core::config::LoggingConfig;
use anyhow::{Context, Result};
use std::path::Path;
use std::str::FromStr;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Target plugin `console.*` calls are logged under
pub const PLUGIN_CONSOLE_TARGET: &str = "plugin_console";

/// Dependencies that are chatty at `debug`
const QUIET_TARGETS: &[&str] = &["hyper", "reqwest", "rustls", "deno_core", "v8"];

const LEVELS: &[&str] = &["debug", "info", "warn", "error"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Text,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(LogFormat::Json),
            "text" => Ok(LogFormat::Text),
            other => anyhow::bail!("Invalid format configuration: {}", other),
        }
    }
}

/// Keeps the background writer alive; drop it last
pub struct Logger {
    _guard: WorkerGuard,
}

impl Logger {
    /// Install the global subscriber described by `config`
    pub fn init(config: &LoggingConfig) -> Result<Self> {
        let directives = filter_directives(config)?;
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));

        let (writer, guard) = open_writer(config)?;
        let format = LogFormat::from_str(&config.format)?;

        let layer: Box<dyn Layer<Registry> + Send + Sync> = match format {
            // engine threads are named after their plugin
            LogFormat::Json => fmt::layer()
                .json()
                .with_writer(writer)
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_thread_names(true)
                .boxed(),
            LogFormat::Text => fmt::layer()
                .with_writer(writer)
                .with_thread_names(true)
                .boxed(),
        };

        tracing_subscriber::registry()
            .with(layer)
            .with(env_filter)
            .try_init()
            .context("Failed to initialize tracing subscriber")?;

        tracing::debug!(%directives, format = %config.format, output = %config.output, "Logging initialized");
        Ok(Logger { _guard: guard })
    }
}

fn open_writer(config: &LoggingConfig) -> Result<(NonBlocking, WorkerGuard)> {
    match config.output.as_str() {
        "stdout" => Ok(tracing_appender::non_blocking(std::io::stdout())),
        "file" => {
            let log_file = config
                .log_file
                .as_deref()
                .context("log_file must be specified when output is 'file'")?;
            let (directory, filename) = split_log_path(log_file)?;
            std::fs::create_dir_all(directory)
                .with_context(|| format!("Failed to create log directory {}", directory.display()))?;
            Ok(tracing_appender::non_blocking(tracing_appender::rolling::daily(directory, filename)))
        }
        other => anyhow::bail!("Invalid output configuration: {}", other),
    }
}

/// `EnvFilter` directives used when `RUST_LOG` is unset
fn filter_directives(config: &LoggingConfig) -> Result<String> {
    let level = checked_level(&config.level)?;
    let plugin_level = match config.plugin_level.as_deref() {
        Some(plugin_level) => checked_level(plugin_level)?,
        None => level.clone(),
    };

    let mut directives = vec![level];
    directives.extend(QUIET_TARGETS.iter().map(|target| format!("{}=warn", target)));
    directives.push(format!("{}={}", PLUGIN_CONSOLE_TARGET, plugin_level));
    Ok(directives.join(","))
}

fn checked_level(level: &str) -> Result<String> {
    let level = level.to_ascii_lowercase();
    if LEVELS.contains(&level.as_str()) {
        Ok(level)
    } else {
        anyhow::bail!("Invalid log level: {}", level)
    }
}

fn split_log_path(log_file: &Path) -> Result<(&Path, &str)> {
    let directory = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let filename = log_file
        .file_name()
        .context("Log file must have a filename")?
        .to_str()
        .context("Log filename must be valid UTF-8")?;

    Ok((directory, filename))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn logging(level: &str, plugin_level: Option<&str>) -> LoggingConfig {
        LoggingConfig {
            level: level.to_string(),
            format: "text".to_string(),
            output: "stdout".to_string(),
            log_file: None,
            plugin_level: plugin_level.map(String::from),
        }
    }

    #[test]
    fn test_filter_directives() {
        let directives = filter_directives(&logging("INFO", None)).unwrap();
        assert!(directives.starts_with("info,"));
        assert!(directives.contains("reqwest=warn"));
        assert!(directives.ends_with("plugin_console=info"));

        let directives = filter_directives(&logging("warn", Some("debug"))).unwrap();
        assert!(directives.ends_with("plugin_console=debug"));
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn test_invalid_levels_rejected() {
        assert!(filter_directives(&logging("verbose", None)).is_err());
        assert!(filter_directives(&logging("info", Some("loud"))).is_err());
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!(LogFormat::from_str("json").unwrap(), LogFormat::Json);
        assert!(LogFormat::from_str("yaml").is_err());
    }

    #[test]
    fn test_split_log_path() {
        let path = PathBuf::from("/var/log/sources/runtime.log");
        let (dir, name) = split_log_path(&path).unwrap();
        assert_eq!(dir, Path::new("/var/log/sources"));
        assert_eq!(name, "runtime.log");

        let (dir, name) = split_log_path(Path::new("runtime.log")).unwrap();
        assert_eq!(dir, Path::new("."));
        assert_eq!(name, "runtime.log");
    }
}
