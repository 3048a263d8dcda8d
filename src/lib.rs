//! Source Runtime Library
//!
//! This library discovers source plugins in a remote catalog, verifies and
//! vets their code, and activates them inside an embedded JavaScript engine
//! behind a typed capability contract.

pub mod cache;
pub mod core;
pub mod plugin;

// Re-export commonly used types
pub use crate::core::{Config, SourceError};
pub use plugin::{PluginManager, PluginRegistry, SourcePlugin};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias for the library
pub type Result<T> = anyhow::Result<T>;
