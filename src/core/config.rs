//! Configuration management

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use config::{Config as ConfigBuilder, ConfigError as BuilderError, Environment, File};
use clap::{Parser, Subcommand};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid catalog configuration: {0}")]
    InvalidCatalog(String),

    #[error("Invalid loader configuration: {0}")]
    InvalidLoader(String),

    #[error("Invalid logging configuration: {0}")]
    InvalidLogging(String),

    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
}

impl From<BuilderError> for ConfigError {
    fn from(err: BuilderError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub catalog: CatalogConfig,
    pub loader: LoaderConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration with precedence: CLI args > Environment variables > Config file > Defaults
    pub fn load(cli_args: &CliArgs) -> Result<Self, ConfigError> {
        let mut builder = Self::defaults(ConfigBuilder::builder())?;

        if let Some(config_path) = &cli_args.config {
            if !config_path.exists() {
                return Err(ConfigError::FileNotFound(
                    config_path.display().to_string()
                ));
            }
            builder = builder.add_source(File::from(config_path.as_path()));
        }

        // Environment variables are prefixed with SOURCES_ and use __ for nesting
        // Example: SOURCES_LOADER__MAX_RETRIES=5
        builder = builder.add_source(
            Environment::with_prefix("SOURCES")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("catalog.mirrors")
                .try_parsing(true)
        );

        if let Some(catalog_url) = &cli_args.catalog_url {
            builder = builder.set_override("catalog.mirrors", vec![catalog_url.clone()])?;
        }
        if let Some(scratch_dir) = &cli_args.scratch_dir {
            builder = builder.set_override("loader.scratch_dir", scratch_dir.display().to_string())?;
        }
        if let Some(log_level) = &cli_args.log_level {
            builder = builder.set_override("logging.level", log_level.clone())?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file path
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let config: Config = Self::defaults(ConfigBuilder::builder())?
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Configuration made only of defaults
    pub fn default_config() -> Result<Self, ConfigError> {
        let config: Config = Self::defaults(ConfigBuilder::builder())?
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        let scratch_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("source-runtime")
            .join("scratch");

        Ok(builder
            .set_default("catalog.mirrors", vec![
                "https://cdn.jsdelivr.net/gh/source-runtime/catalog@main/catalog.json",
                "https://raw.githubusercontent.com/source-runtime/catalog/main/catalog.json",
            ])?
            .set_default("catalog.timeout_secs", 15)?
            .set_default("catalog.max_retries", 2)?
            .set_default("loader.fetch_timeout_secs", 30)?
            .set_default("loader.max_retries", 3)?
            .set_default("loader.initial_backoff_ms", 250)?
            .set_default("loader.max_backoff_ms", 4000)?
            .set_default("loader.scratch_dir", scratch_dir.display().to_string())?
            .set_default("loader.activation_timeout_secs", 10)?
            .set_default("loader.call_timeout_secs", 60)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "text")?
            .set_default("logging.output", "stdout")?)
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.catalog.validate()?;
        self.loader.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

/// Command-line arguments for configuration override
#[derive(Debug, Parser)]
#[command(name = "source-runtime")]
#[command(about = "Discover, verify and activate source plugins", long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Catalog URL (replaces the configured mirrors)
    #[arg(long, value_name = "URL")]
    pub catalog_url: Option<String>,

    /// Scratch directory for plugin activation
    #[arg(long, value_name = "DIR")]
    pub scratch_dir: Option<PathBuf>,

    /// Log level (debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// List every plugin in the catalog
    Browse,
    /// Search the catalog by id, name, domain or tag
    Search {
        query: String,
    },
    /// Install a plugin and optionally run a search through it
    Install {
        id: String,
        /// Query to send to the freshly installed plugin
        #[arg(long)]
        query: Option<String>,
    },
    /// Install the given plugins and report which have newer catalog versions
    Updates {
        ids: Vec<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    pub mirrors: Vec<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl CatalogConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mirrors.is_empty() {
            return Err(ConfigError::InvalidCatalog("mirrors cannot be empty".to_string()));
        }

        for mirror in &self.mirrors {
            let parsed = url::Url::parse(mirror)
                .map_err(|e| ConfigError::InvalidCatalog(format!("invalid mirror {}: {}", mirror, e)))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::InvalidCatalog(
                    format!("mirror {} must use http or https", mirror)
                ));
            }
        }

        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidCatalog("timeout_secs must be greater than 0".to_string()));
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoaderConfig {
    pub fetch_timeout_secs: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub scratch_dir: PathBuf,
    pub activation_timeout_secs: u64,
    pub call_timeout_secs: u64,
}

impl LoaderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::InvalidLoader("fetch_timeout_secs must be greater than 0".to_string()));
        }

        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::InvalidLoader(
                "max_backoff_ms must not be smaller than initial_backoff_ms".to_string()
            ));
        }

        if self.scratch_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidLoader("scratch_dir cannot be empty".to_string()));
        }

        if self.activation_timeout_secs == 0 {
            return Err(ConfigError::InvalidLoader("activation_timeout_secs must be greater than 0".to_string()));
        }

        if self.call_timeout_secs == 0 {
            return Err(ConfigError::InvalidLoader("call_timeout_secs must be greater than 0".to_string()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub log_file: Option<PathBuf>,
    /// Level for plugin `console` output; defaults to `level`
    #[serde(default)]
    pub plugin_level: Option<String>,
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.as_str()) {
            return Err(ConfigError::InvalidLogging(
                format!("level must be one of: {:?}", valid_levels)
            ));
        }

        if let Some(plugin_level) = &self.plugin_level {
            if !valid_levels.contains(&plugin_level.as_str()) {
                return Err(ConfigError::InvalidLogging(
                    format!("plugin_level must be one of: {:?}", valid_levels)
                ));
            }
        }

        let valid_formats = ["json", "text"];
        if !valid_formats.contains(&self.format.as_str()) {
            return Err(ConfigError::InvalidLogging(
                format!("format must be one of: {:?}", valid_formats)
            ));
        }

        let valid_outputs = ["stdout", "file"];
        if !valid_outputs.contains(&self.output.as_str()) {
            return Err(ConfigError::InvalidLogging(
                format!("output must be one of: {:?}", valid_outputs)
            ));
        }

        if self.output == "file" && self.log_file.is_none() {
            return Err(ConfigError::InvalidLogging(
                "log_file must be specified when output is 'file'".to_string()
            ));
        }

        Ok(())
    }
}
