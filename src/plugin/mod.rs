//! Plugin system module
//!
//! This module provides the source plugin runtime:
//! - Catalog access and the install/update/uninstall facade
//! - Artifact fetching, integrity checks and static validation
//! - Activation of plugin code inside an embedded JavaScript engine
//! - The registry of live plugin instances

pub mod activator;
pub mod catalog;
pub mod events;
pub mod fetcher;
pub mod instance;
pub mod integrity;
pub mod js_bindings;
pub mod js_runtime;
pub mod js_wrapper;
pub mod loader;
pub mod manager;
pub mod registry;
pub mod source;
pub mod types;
pub mod validator;
pub mod version;

#[cfg(test)]
pub(crate) mod test_support;

pub use activator::{Activator, JsActivator};
pub use catalog::{Catalog, CatalogDocument, HttpCatalog, StaticCatalog};
pub use events::{InstallStage, ProgressReporter, ProgressSink};
pub use fetcher::{ArtifactFetcher, FetchPolicy, HttpFetcher};
pub use instance::PluginInstance;
pub use loader::PluginLoader;
pub use manager::{PluginManager, UpdateInfo};
pub use registry::PluginRegistry;
pub use source::{Asset, Item, ListOptions, PaginationInfo, SourcePlugin};
pub use types::{Capabilities, Capability, PluginDescriptor, PluginId, ValidationVerdict};
pub use validator::ValidatedSource;
