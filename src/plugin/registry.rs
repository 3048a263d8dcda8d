//! Plugin registry implementation
//!
//! This module provides the registry that holds every active plugin
//! instance for the process. There is exactly one instance per id; it is
//! created once and handed to whoever needs it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::core::error::{Result, SourceError};
use super::instance::PluginInstance;
use super::types::{Capability, PluginId};

/// Plugin registry
///
/// Maps plugin id to the live instance. Readers share the table; register
/// and unregister take it exclusively.
pub struct PluginRegistry {
    /// Map of plugin ID to active instance
    plugins: RwLock<HashMap<PluginId, Arc<PluginInstance>>>,

    /// Cleared by `shutdown`, set again by `init`
    open: AtomicBool,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    /// Create a new empty plugin registry
    pub fn new() -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
            open: AtomicBool::new(true),
        }
    }

    /// Open the registry for registrations
    pub async fn init(&self) {
        if !self.open.swap(true, Ordering::SeqCst) {
            info!("Plugin registry reopened");
        }
    }

    /// Register an instance under its id
    ///
    /// # Arguments
    /// * `instance` - Activated plugin instance
    ///
    /// # Returns
    /// The instance previously registered under the same id, if any.
    /// The new instance fully replaces it.
    ///
    /// # Errors
    /// Returns an error if the registry has been shut down
    pub async fn register(&self, instance: Arc<PluginInstance>) -> Result<Option<Arc<PluginInstance>>> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(SourceError::Internal(format!(
                "Cannot register plugin {}: registry is shut down",
                instance.id
            )));
        }

        let id = instance.id.clone();
        let version = instance.version.clone();
        let replaced = self.plugins.write().await.insert(id.clone(), instance);

        match &replaced {
            Some(old) => info!(plugin_id = %id, old_version = %old.version, version = %version, "Replaced plugin"),
            None => info!(plugin_id = %id, version = %version, "Registered plugin"),
        }
        Ok(replaced)
    }

    /// Unregister a plugin
    ///
    /// # Returns
    /// `true` if an instance was removed
    pub async fn unregister(&self, id: &str) -> bool {
        self.take(id).await.is_some()
    }

    /// Remove and return the instance registered under `id`
    pub async fn take(&self, id: &str) -> Option<Arc<PluginInstance>> {
        let removed = self.plugins.write().await.remove(id);
        if removed.is_some() {
            info!(plugin_id = %id, "Unregistered plugin");
        }
        removed
    }

    /// Get a plugin instance by ID
    pub async fn get(&self, id: &str) -> Option<Arc<PluginInstance>> {
        self.plugins.read().await.get(id).cloned()
    }

    pub async fn has(&self, id: &str) -> bool {
        self.plugins.read().await.contains_key(id)
    }

    /// List all registered plugins
    ///
    /// # Returns
    /// A snapshot sorted by id; later registry changes do not show up in it
    pub async fn list(&self) -> Vec<Arc<PluginInstance>> {
        let mut instances: Vec<_> = self.plugins.read().await.values().cloned().collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        instances
    }

    /// Find plugins that both declare and implement a capability
    ///
    /// # Arguments
    /// * `capability` - Capability to filter on
    pub async fn filter_by_capability(&self, capability: Capability) -> Vec<Arc<PluginInstance>> {
        self.list()
            .await
            .into_iter()
            .filter(|instance| instance.supports(capability))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.plugins.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.plugins.read().await.is_empty()
    }

    /// Drop every instance without shutting it down
    pub async fn clear(&self) {
        self.plugins.write().await.clear();
    }

    /// Shut every instance down and close the registry
    ///
    /// Failures are logged; every instance is attempted.
    pub async fn shutdown(&self) {
        self.open.store(false, Ordering::SeqCst);
        let drained: Vec<_> = self.plugins.write().await.drain().collect();

        for (id, instance) in drained {
            if let Err(e) = instance.source().shutdown().await {
                warn!(plugin_id = %id, error = %e, "Failed to shut plugin down");
            }
        }
        info!("Plugin registry shut down");
    }
}
