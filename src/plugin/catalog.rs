//! Plugin catalog
//!
//! The catalog lists installable plugins. `HttpCatalog` reads a JSON
//! document from the first mirror that answers; `StaticCatalog` holds
//! descriptors in memory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::core::config::CatalogConfig;
use crate::core::error::{Result, SourceError};
use super::fetcher::{ArtifactFetcher, FetchPolicy};
use super::types::PluginDescriptor;

/// Source of plugin descriptors
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Every known descriptor, sorted by id
    async fn list(&self) -> Result<Vec<PluginDescriptor>>;

    /// Reload from the backing store, returning the number of descriptors
    async fn refresh(&self) -> Result<usize>;

    async fn get(&self, id: &str) -> Result<PluginDescriptor> {
        self.list()
            .await?
            .into_iter()
            .find(|descriptor| descriptor.id == id)
            .ok_or_else(|| SourceError::NotFound(format!("Plugin '{}' is not in the catalog", id)))
    }
}

/// Catalog document as served by a mirror
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogDocument {
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(default)]
    pub total_sources: Option<u64>,
    #[serde(default)]
    pub maintainer: Option<String>,
    #[serde(default, alias = "plugins")]
    pub sources: Vec<Value>,
}

/// A catalog document split into usable descriptors and rejected records
#[derive(Debug, Clone, Default)]
pub struct CatalogEntries {
    /// Sorted by id
    pub descriptors: Vec<PluginDescriptor>,
    /// Why each rejected id could not be used
    pub rejected: BTreeMap<String, String>,
}

impl CatalogDocument {
    /// Sort every record into usable or rejected
    ///
    /// When an id occurs twice the later record wins, whichever way it
    /// went. Records without an id cannot be looked up and are only logged.
    pub fn entries(&self) -> CatalogEntries {
        let mut by_id = BTreeMap::new();
        let mut rejected = BTreeMap::new();

        for (index, record) in self.sources.iter().enumerate() {
            let outcome = serde_json::from_value::<PluginDescriptor>(record.clone())
                .map_err(|e| e.to_string())
                .and_then(|descriptor| match descriptor.validate() {
                    Ok(()) => Ok(descriptor),
                    Err(SourceError::InvalidDescriptor(reason)) => Err(reason),
                    Err(e) => Err(e.to_string()),
                });

            match outcome {
                Ok(descriptor) => {
                    rejected.remove(&descriptor.id);
                    by_id.insert(descriptor.id.clone(), descriptor);
                }
                Err(reason) => {
                    let id = record.get("id").and_then(Value::as_str);
                    warn!(index, plugin_id = id.unwrap_or("<none>"), error = %reason, "Rejected catalog record");
                    if let Some(id) = id {
                        by_id.remove(id);
                        rejected.insert(id.to_string(), reason);
                    }
                }
            }
        }

        CatalogEntries {
            descriptors: by_id.into_values().collect(),
            rejected,
        }
    }

    /// Well-formed descriptors in the document
    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        self.entries().descriptors
    }
}

/// Parse a catalog document from raw bytes
pub fn parse_catalog(bytes: &[u8]) -> Result<CatalogDocument> {
    serde_json::from_slice(bytes).map_err(|e| SourceError::Catalog(format!("Malformed catalog document: {}", e)))
}

struct Snapshot {
    descriptors: Vec<PluginDescriptor>,
    rejected: BTreeMap<String, String>,
    mirror: String,
    fetched_at: DateTime<Utc>,
}

/// Catalog served over HTTP from an ordered list of mirrors
pub struct HttpCatalog {
    mirrors: Vec<String>,
    fetcher: Arc<dyn ArtifactFetcher>,
    policy: FetchPolicy,
    snapshot: RwLock<Option<Snapshot>>,
}

impl HttpCatalog {
    pub fn new(mirrors: Vec<String>, fetcher: Arc<dyn ArtifactFetcher>, policy: FetchPolicy) -> Self {
        Self {
            mirrors,
            fetcher,
            policy,
            snapshot: RwLock::new(None),
        }
    }

    pub fn from_config(config: &CatalogConfig, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        let policy = FetchPolicy {
            timeout: config.timeout(),
            max_retries: config.max_retries,
            ..FetchPolicy::default()
        };
        Self::new(config.mirrors.clone(), fetcher, policy)
    }

    /// Mirror the current snapshot came from, and when
    pub async fn source(&self) -> Option<(String, DateTime<Utc>)> {
        self.snapshot
            .read()
            .await
            .as_ref()
            .map(|s| (s.mirror.clone(), s.fetched_at))
    }

    async fn download(&self) -> Result<Snapshot> {
        let mut failures = Vec::new();

        for mirror in &self.mirrors {
            debug!(url = %mirror, "Fetching catalog");
            let bytes = match self.fetcher.fetch(mirror, &self.policy).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(url = %mirror, error = %e, "Catalog mirror failed");
                    failures.push(format!("{}: {}", mirror, e));
                    continue;
                }
            };

            match parse_catalog(&bytes) {
                Ok(document) => {
                    let CatalogEntries { descriptors, rejected } = document.entries();
                    if let Some(total) = document.total_sources {
                        if total as usize != descriptors.len() {
                            debug!(url = %mirror, total, usable = descriptors.len(), "Catalog count differs from header");
                        }
                    }
                    info!(
                        url = %mirror,
                        count = descriptors.len(),
                        rejected = rejected.len(),
                        last_updated = document.last_updated.as_deref().unwrap_or("unknown"),
                        "Catalog loaded"
                    );
                    return Ok(Snapshot {
                        descriptors,
                        rejected,
                        mirror: mirror.clone(),
                        fetched_at: Utc::now(),
                    });
                }
                Err(e) => {
                    warn!(url = %mirror, error = %e, "Catalog mirror served an unreadable document");
                    failures.push(format!("{}: {}", mirror, e));
                }
            }
        }

        Err(SourceError::Catalog(if failures.is_empty() {
            "No catalog mirrors configured".to_string()
        } else {
            format!("All catalog mirrors failed: {}", failures.join("; "))
        }))
    }
}

#[async_trait]
impl Catalog for HttpCatalog {
    async fn list(&self) -> Result<Vec<PluginDescriptor>> {
        if let Some(snapshot) = self.snapshot.read().await.as_ref() {
            return Ok(snapshot.descriptors.clone());
        }

        let mut guard = self.snapshot.write().await;
        // another caller may have loaded it while we waited
        if guard.is_none() {
            *guard = Some(self.download().await?);
        }
        Ok(guard.as_ref().map(|s| s.descriptors.clone()).unwrap_or_default())
    }

    /// Unknown ids are `NotFound`; ids whose record was rejected are
    /// `InvalidDescriptor`
    async fn get(&self, id: &str) -> Result<PluginDescriptor> {
        if let Some(descriptor) = self.list().await?.into_iter().find(|d| d.id == id) {
            return Ok(descriptor);
        }

        let snapshot = self.snapshot.read().await;
        match snapshot.as_ref().and_then(|s| s.rejected.get(id)) {
            Some(reason) => Err(SourceError::InvalidDescriptor(format!(
                "catalog entry '{}' is unusable: {}",
                id, reason
            ))),
            None => Err(SourceError::NotFound(format!("Plugin '{}' is not in the catalog", id))),
        }
    }

    async fn refresh(&self) -> Result<usize> {
        let snapshot = self.download().await?;
        let count = snapshot.descriptors.len();
        *self.snapshot.write().await = Some(snapshot);
        Ok(count)
    }
}

/// Catalog backed by an in-memory table
#[derive(Default)]
pub struct StaticCatalog {
    descriptors: RwLock<BTreeMap<String, PluginDescriptor>>,
}

impl StaticCatalog {
    pub fn new(descriptors: impl IntoIterator<Item = PluginDescriptor>) -> Self {
        Self {
            descriptors: RwLock::new(descriptors.into_iter().map(|d| (d.id.clone(), d)).collect()),
        }
    }

    /// Insert or replace a descriptor
    pub async fn upsert(&self, descriptor: PluginDescriptor) {
        self.descriptors.write().await.insert(descriptor.id.clone(), descriptor);
    }

    pub async fn remove(&self, id: &str) -> Option<PluginDescriptor> {
        self.descriptors.write().await.remove(id)
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn list(&self) -> Result<Vec<PluginDescriptor>> {
        Ok(self.descriptors.read().await.values().cloned().collect())
    }

    async fn refresh(&self) -> Result<usize> {
        Ok(self.descriptors.read().await.len())
    }
}
