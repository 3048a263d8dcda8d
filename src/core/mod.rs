//! Core application layer
//!
//! This module provides the ambient pieces shared by the plugin runtime:
//! - Configuration management
//! - Structured logging system
//! - Error handling and type system

pub mod config;
pub mod logging;
pub mod error;

pub use config::{CliArgs, Command, Config, ConfigError};
pub use logging::Logger;
pub use error::{ErrorContext, FetchError, FetchErrorKind, Result, SourceError};
