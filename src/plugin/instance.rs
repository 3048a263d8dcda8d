//! Activated plugin instances

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

use crate::core::error::{Result, SourceError};
use super::source::{Item, ListOptions, SourcePlugin};
use super::types::{Capabilities, Capability, PluginDescriptor, PluginId};

/// A live, callable plugin as owned by the registry
///
/// Created by the activator and replaced wholesale on update; the fields
/// never change after construction.
pub struct PluginInstance {
    pub id: PluginId,
    pub display_name: String,
    pub version: String,
    pub base_endpoint: String,
    /// Capabilities the catalog says the plugin has
    pub declared: Capabilities,
    /// Capabilities the activated code actually implements
    pub implemented: Capabilities,
    /// SHA-256 of the artifact this instance was built from
    pub digest: String,
    pub activated_at: DateTime<Utc>,
    source: Arc<dyn SourcePlugin>,
}

impl PluginInstance {
    pub fn new(descriptor: &PluginDescriptor, digest: String, source: Arc<dyn SourcePlugin>) -> Self {
        let implemented = source.capabilities();
        Self {
            id: descriptor.id.clone(),
            display_name: descriptor.display_name.clone(),
            version: descriptor.version.clone(),
            base_endpoint: descriptor.base_endpoint.clone(),
            declared: descriptor.capabilities,
            implemented,
            digest,
            activated_at: Utc::now(),
            source,
        }
    }

    /// Declared by the catalog AND implemented by the code
    pub fn supports(&self, capability: Capability) -> bool {
        self.declared.has(capability) && self.implemented.has(capability)
    }

    /// Capabilities usable through this instance
    pub fn effective_capabilities(&self) -> Capabilities {
        self.declared.intersection(&self.implemented)
    }

    pub fn source(&self) -> &Arc<dyn SourcePlugin> {
        &self.source
    }

    fn require(&self, capability: Capability) -> Result<()> {
        if self.supports(capability) {
            Ok(())
        } else {
            Err(SourceError::Unsupported {
                id: self.id.clone(),
                capability,
            })
        }
    }

    pub async fn get_latest(&self, options: &ListOptions) -> Result<Vec<Item>> {
        self.require(Capability::Latest)?;
        self.source.get_latest(options).await
    }

    pub async fn get_popular(&self, options: &ListOptions) -> Result<Vec<Item>> {
        self.require(Capability::Popular)?;
        self.source.get_popular(options).await
    }

    pub async fn get_trending(&self, options: &ListOptions) -> Result<Vec<Item>> {
        self.require(Capability::Trending)?;
        self.source.get_trending(options).await
    }
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginInstance")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("declared", &self.declared)
            .field("implemented", &self.implemented)
            .field("digest", &self.digest)
            .finish()
    }
}
