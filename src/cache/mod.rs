//! Cache management module
//!
//! Keeps activated plugin instances by id and version, and de-duplicates
//! concurrent work on the same key.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OwnedMutexGuard, RwLock};
use tracing::debug;

use crate::core::error::{Result, SourceError};
use crate::plugin::instance::PluginInstance;
use crate::plugin::types::PluginId;

/// A cached activation
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub id: PluginId,
    pub version: String,
    pub instance: Arc<PluginInstance>,
    pub fetched_at: DateTime<Utc>,
}

/// In-memory cache of activated instances keyed by plugin id
///
/// Only one version per id is held; storing a different version
/// supersedes the previous entry.
#[derive(Default)]
pub struct PluginCache {
    entries: RwLock<HashMap<PluginId, CacheEntry>>,
}

impl PluginCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instance cached for `id` at exactly `version`
    pub async fn get(&self, id: &str, version: &str) -> Option<Arc<PluginInstance>> {
        let entries = self.entries.read().await;
        entries
            .get(id)
            .filter(|entry| entry.version == version)
            .map(|entry| Arc::clone(&entry.instance))
    }

    /// Whatever is cached for `id`, regardless of version
    pub async fn entry(&self, id: &str) -> Option<CacheEntry> {
        self.entries.read().await.get(id).cloned()
    }

    /// Store an instance, returning the entry it superseded
    pub async fn put(&self, id: &str, version: &str, instance: Arc<PluginInstance>) -> Option<CacheEntry> {
        let entry = CacheEntry {
            id: id.to_string(),
            version: version.to_string(),
            instance,
            fetched_at: Utc::now(),
        };
        let previous = self.entries.write().await.insert(id.to_string(), entry);
        if let Some(old) = &previous {
            if old.version != version {
                debug!(plugin_id = %id, old_version = %old.version, version = %version, "Superseded cached plugin");
            }
        }
        previous
    }

    pub async fn invalidate(&self, id: &str) -> Option<CacheEntry> {
        self.entries.write().await.remove(id)
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type SharedResult<V> = Shared<BoxFuture<'static, Result<V>>>;

struct Flight<V> {
    generation: u64,
    future: SharedResult<V>,
}

/// Coalesces concurrent calls that share a key
///
/// The first caller for a key becomes the leader: its work is spawned onto
/// the runtime so that dropping any caller (the leader included) does not
/// abort it. Every caller that arrives while the work is in flight receives
/// a clone of the same result.
pub struct SingleFlight<V> {
    flights: Arc<Mutex<HashMap<String, Flight<V>>>>,
    generation: AtomicU64,
}

impl<V> Default for SingleFlight<V> {
    fn default() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }
}

impl<V> SingleFlight<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key`, or join the flight already running for it
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let future = {
            let mut flights = lock(&self.flights);
            match flights.get(key) {
                Some(flight) => {
                    debug!(key, "Joining in-flight operation");
                    flight.future.clone()
                }
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let registry = Arc::clone(&self.flights);
                    let owned_key = key.to_string();
                    let work = work();

                    let handle = tokio::spawn(async move {
                        let result = work.await;
                        let mut flights = lock(&registry);
                        if flights.get(&owned_key).map(|f| f.generation) == Some(generation) {
                            flights.remove(&owned_key);
                        }
                        result
                    });

                    let future = async move {
                        match handle.await {
                            Ok(result) => result,
                            Err(e) => Err(SourceError::Internal(format!("In-flight task failed: {}", e))),
                        }
                    }
                    .boxed()
                    .shared();

                    flights.insert(
                        key.to_string(),
                        Flight {
                            generation,
                            future: future.clone(),
                        },
                    );
                    future
                }
            }
        };

        future.await
    }

    /// Number of keys with work in flight
    pub fn in_flight(&self) -> usize {
        lock(&self.flights).len()
    }
}

/// Per-key async mutexes
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = lock(&self.locks);
            // nobody holds or waits on these
            locks.retain(|_, m| Arc::strong_count(m) > 1);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        mutex.lock_owned().await
    }
}
