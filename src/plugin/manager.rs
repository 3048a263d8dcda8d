//! Plugin manager
//!
//! The runtime facade: browse and search the catalog, install, update and
//! uninstall plugins. Per id, work is coalesced (concurrent installs share
//! one pipeline run) and serialized (install, update and uninstall never
//! interleave their registry changes).

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{KeyedLocks, PluginCache, SingleFlight};
use crate::core::config::Config;
use crate::core::error::{Result, SourceError};
use super::catalog::{Catalog, HttpCatalog};
use super::activator::JsActivator;
use super::events::{InstallStage, ProgressReporter, ProgressSink};
use super::fetcher::{FetchPolicy, HttpFetcher};
use super::instance::PluginInstance;
use super::loader::PluginLoader;
use super::registry::PluginRegistry;
use super::types::{PluginDescriptor, PluginId};
use super::version::is_newer;

/// An installed plugin with a newer catalog version
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateInfo {
    pub id: PluginId,
    pub current_version: String,
    pub available_version: String,
}

struct ManagerInner {
    catalog: Arc<dyn Catalog>,
    loader: PluginLoader,
    registry: Arc<PluginRegistry>,
    cache: PluginCache,
    flights: SingleFlight<Arc<PluginInstance>>,
    locks: KeyedLocks,
}

/// Manager for the plugin system
#[derive(Clone)]
pub struct PluginManager {
    inner: Arc<ManagerInner>,
}

impl PluginManager {
    pub fn new(catalog: Arc<dyn Catalog>, loader: PluginLoader, registry: Arc<PluginRegistry>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                catalog,
                loader,
                registry,
                cache: PluginCache::new(),
                flights: SingleFlight::new(),
                locks: KeyedLocks::new(),
            }),
        }
    }

    /// Manager wired to the HTTP catalog, HTTP fetcher and JavaScript engine
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let fetcher = Arc::new(HttpFetcher::new()?);
        let catalog = Arc::new(HttpCatalog::from_config(&config.catalog, fetcher.clone()));
        let loader = PluginLoader::new(
            fetcher,
            Arc::new(JsActivator::from_config(&config.loader)),
            FetchPolicy::from_config(&config.loader),
        );
        Ok(Self::new(catalog, loader, Arc::new(PluginRegistry::new())))
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.inner.registry
    }

    /// Open the registry and warm the catalog
    ///
    /// An unreachable catalog is logged, not fatal; it is retried on first use.
    pub async fn init(&self) -> Result<()> {
        self.inner.registry.init().await;
        match self.inner.catalog.list().await {
            Ok(descriptors) => info!(count = descriptors.len(), "Plugin manager initialized"),
            Err(e) => warn!(error = %e, "Plugin manager initialized without a catalog"),
        }
        Ok(())
    }

    /// Shut every installed plugin down
    pub async fn shutdown(&self) {
        info!("Shutting down plugin manager");
        self.inner.registry.shutdown().await;
        self.inner.cache.clear().await;
    }

    pub async fn browse_catalog(&self) -> Result<Vec<PluginDescriptor>> {
        self.inner.catalog.list().await
    }

    /// Case-insensitive substring match over id, name, endpoint and tags
    pub async fn search_catalog(&self, query: &str) -> Result<Vec<PluginDescriptor>> {
        let needle = query.trim().to_lowercase();
        let descriptors = self.inner.catalog.list().await?;
        if needle.is_empty() {
            return Ok(descriptors);
        }

        Ok(descriptors
            .into_iter()
            .filter(|d| {
                d.id.to_lowercase().contains(&needle)
                    || d.display_name.to_lowercase().contains(&needle)
                    || d.base_endpoint.to_lowercase().contains(&needle)
                    || d.tags.iter().any(|t| t.to_lowercase().contains(&needle))
            })
            .collect())
    }

    /// Reload the catalog from its mirrors
    pub async fn sync_catalog(&self) -> Result<usize> {
        let count = self.inner.catalog.refresh().await?;
        info!(count, "Catalog synced");
        Ok(count)
    }

    pub async fn installed(&self) -> Vec<Arc<PluginInstance>> {
        self.inner.registry.list().await
    }

    pub async fn get(&self, id: &str) -> Option<Arc<PluginInstance>> {
        self.inner.registry.get(id).await
    }

    /// Install the catalog's current version of `id`
    ///
    /// Concurrent calls for the same id share one pipeline run and receive
    /// the same instance or the same error. Only the caller that started
    /// the run sees intermediate progress; every successful caller sees 100.
    pub async fn install(&self, id: &str, progress: Option<ProgressSink>) -> Result<Arc<PluginInstance>> {
        let reporter = ProgressReporter::new(progress);
        let inner = Arc::clone(&self.inner);
        let owned_id = id.to_string();
        let leader_reporter = reporter.clone();

        let instance = self
            .inner
            .flights
            .run(&format!("install:{}", id), move || async move {
                inner.install(&owned_id, &leader_reporter).await
            })
            .await?;

        reporter.stage(InstallStage::Complete);
        Ok(instance)
    }

    /// Move an installed plugin to the catalog's version if it is newer
    ///
    /// The old instance stays registered unless the new one activates.
    pub async fn update(&self, id: &str, progress: Option<ProgressSink>) -> Result<Arc<PluginInstance>> {
        let reporter = ProgressReporter::new(progress);
        let inner = Arc::clone(&self.inner);
        let owned_id = id.to_string();
        let leader_reporter = reporter.clone();

        let instance = self
            .inner
            .flights
            .run(&format!("update:{}", id), move || async move {
                inner.update(&owned_id, &leader_reporter).await
            })
            .await?;

        reporter.stage(InstallStage::Complete);
        Ok(instance)
    }

    /// Remove a plugin and shut it down
    ///
    /// The id is free for a new install as soon as the instance leaves the
    /// registry; shutting the old engine down happens outside the id lock.
    ///
    /// # Returns
    /// `true` if the plugin was installed
    pub async fn uninstall(&self, id: &str) -> Result<bool> {
        let removed = {
            let _guard = self.inner.locks.lock(id).await;
            self.inner.cache.invalidate(id).await;
            self.inner.registry.take(id).await
        };
        let Some(instance) = removed else {
            debug!(plugin_id = %id, "Uninstall of a plugin that is not installed");
            return Ok(false);
        };

        if let Err(e) = instance.source().shutdown().await {
            warn!(plugin_id = %id, error = %e, "Plugin did not shut down cleanly");
        }
        info!(plugin_id = %id, version = %instance.version, "Plugin uninstalled");
        Ok(true)
    }

    /// Installed plugins whose catalog version has higher precedence
    pub async fn check_for_updates(&self) -> Result<Vec<UpdateInfo>> {
        let installed = self.inner.registry.list().await;
        if installed.is_empty() {
            return Ok(Vec::new());
        }

        let catalog = self.inner.catalog.list().await?;
        let mut updates = Vec::new();
        for instance in installed {
            let Some(descriptor) = catalog.iter().find(|d| d.id == instance.id) else {
                debug!(plugin_id = %instance.id, "Installed plugin is no longer in the catalog");
                continue;
            };
            if is_newer(&descriptor.version, &instance.version) {
                updates.push(UpdateInfo {
                    id: instance.id.clone(),
                    current_version: instance.version.clone(),
                    available_version: descriptor.version.clone(),
                });
            }
        }

        info!(count = updates.len(), "Checked for plugin updates");
        Ok(updates)
    }
}

impl ManagerInner {
    async fn install(&self, id: &str, progress: &ProgressReporter) -> Result<Arc<PluginInstance>> {
        let _guard = self.locks.lock(id).await;
        let descriptor = self.catalog.get(id).await?;

        if let Some(instance) = self.cache.get(id, &descriptor.version).await {
            debug!(plugin_id = %id, version = %descriptor.version, "Plugin cache hit");
            if !self.registry.has(id).await {
                self.registry.register(Arc::clone(&instance)).await?;
            }
            progress.stage(InstallStage::Registered);
            return Ok(instance);
        }

        info!(plugin_id = %id, version = %descriptor.version, "Installing plugin");
        self.activate_and_register(&descriptor, progress).await
    }

    async fn update(&self, id: &str, progress: &ProgressReporter) -> Result<Arc<PluginInstance>> {
        let _guard = self.locks.lock(id).await;
        let current = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| SourceError::NotFound(format!("Plugin '{}' is not installed", id)))?;
        let descriptor = self.catalog.get(id).await?;

        if !is_newer(&descriptor.version, &current.version) {
            debug!(plugin_id = %id, version = %current.version, "Plugin already up to date");
            return Ok(current);
        }

        info!(
            plugin_id = %id,
            old_version = %current.version,
            version = %descriptor.version,
            "Updating plugin"
        );
        self.activate_and_register(&descriptor, progress).await
    }

    async fn activate_and_register(
        &self,
        descriptor: &PluginDescriptor,
        progress: &ProgressReporter,
    ) -> Result<Arc<PluginInstance>> {
        let instance = Arc::new(self.loader.load(descriptor, progress).await?);

        self.registry.register(Arc::clone(&instance)).await?;
        progress.stage(InstallStage::Registered);
        self.cache
            .put(&descriptor.id, &descriptor.version, Arc::clone(&instance))
            .await;
        Ok(instance)
    }
}
