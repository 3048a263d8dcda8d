//! Shared fixtures for plugin tests

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::core::error::{FetchError, Result, SourceError};
use super::activator::{Activator, JsActivator};
use super::fetcher::{ArtifactFetcher, FetchPolicy};
use super::instance::PluginInstance;
use super::integrity::sha256_hex;
use super::source::{Asset, Item, ListOptions, PaginationInfo, SourcePlugin};
use super::types::{Capabilities, PluginDescriptor};
use super::validator::ValidatedSource;

/// CommonJS plugin implementing only the mandatory methods
pub const MINIMAL_PLUGIN: &str = r#"
const { BaseSource } = require('@sources/base');

class MinimalSource extends BaseSource {
    async search(query, options) {
        return [{ id: query, title: query, page: options ? options.page : null }];
    }
    async getDetails(id) {
        return { id, title: 'Title ' + id };
    }
    async getChildren(parentId) {
        return [{ id: parentId + '-1', title: 'Chapter 1', number: 1 }];
    }
    async getLeafAssets(childId) {
        return [{ index: 0, url: 'https://minimal.example/' + childId + '/0.jpg' }];
    }
    async listAll(options) {
        return [];
    }
    async extractPaginationInfo(url) {
        return { currentPage: 1, hasNextPage: false };
    }
}

module.exports = MinimalSource;
"#;

/// ES module plugin with one optional listing and a few helper calls
pub const ESM_PLUGIN: &str = r#"
import { BaseSource } from '@sources/base';

const PAGE_PATTERN = /page=(\d+)/;

export default class FixtureSource extends BaseSource {
    async search(query, options) {
        return [{ id: 'r-' + query, title: `Result for ${query}`, page: options.page }];
    }

    async getDetails(id) {
        return { id, title: 'Details ' + id, url: this.absoluteUrl('/title/' + id) };
    }

    async getChildren(parentId) {
        if (parentId === 'missing') {
            throw new Error('no such title: ' + parentId);
        }
        return [{ id: parentId + '-1', title: 'Chapter 1', number: 1 }];
    }

    async getLeafAssets(childId) {
        return [
            this.absoluteUrl(`/${childId}/1.png`),
            this.absoluteUrl(`/${childId}/2.png`),
        ];
    }

    async listAll(options) {
        return { items: [{ id: 'a', title: 'A' }, { id: 'b', title: 'B' }] };
    }

    async extractPaginationInfo(url) {
        const match = PAGE_PATTERN.exec(url);
        const current = match ? Number(match[1]) : 1;
        return {
            currentPage: current,
            hasNextPage: current < 10,
            nextUrl: url.replace(PAGE_PATTERN, 'page=' + (current + 1)),
        };
    }

    async getLatest(options) {
        return [{ id: 'new-1', title: 'New 1' }, { id: 'new-2', title: 'New 2' }];
    }
}
"#;

/// Descriptor whose digest matches `bytes`
pub fn sample_descriptor(id: &str, version: &str, artifact_url: &str, bytes: &[u8]) -> PluginDescriptor {
    PluginDescriptor {
        id: id.to_string(),
        display_name: id.replace('-', " "),
        version: version.to_string(),
        base_endpoint: "https://fixture.example".to_string(),
        artifact_url: artifact_url.to_string(),
        expected_digest: Some(sha256_hex(bytes)),
        capabilities: Capabilities {
            search: true,
            ..Default::default()
        },
        description: None,
        language: Some("en".to_string()),
        icon_url: None,
        nsfw: false,
        tags: vec!["fixture".to_string()],
    }
}

/// Start an axum server on an ephemeral port
pub async fn serve(app: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// In-memory fetcher that counts requests per URL
#[derive(Default)]
pub struct MockFetcher {
    responses: Mutex<HashMap<String, std::result::Result<Bytes, FetchError>>>,
    counts: Mutex<HashMap<String, usize>>,
    delay: Option<Duration>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_artifact(self, url: &str, bytes: impl Into<Bytes>) -> Self {
        self.set_artifact(url, bytes);
        self
    }

    pub fn set_artifact(&self, url: &str, bytes: impl Into<Bytes>) {
        self.responses.lock().unwrap().insert(url.to_string(), Ok(bytes.into()));
    }

    pub fn set_failure(&self, url: &str, err: FetchError) {
        self.responses.lock().unwrap().insert(url.to_string(), Err(err));
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        self.counts.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.counts.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl ArtifactFetcher for MockFetcher {
    async fn fetch(&self, url: &str, _policy: &FetchPolicy) -> std::result::Result<Bytes, FetchError> {
        *self.counts.lock().unwrap().entry(url.to_string()).or_insert(0) += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.responses
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_else(|| {
                Err(FetchError::new(url, crate::core::error::FetchErrorKind::HttpStatus, "Not Found")
                    .with_status(404)
                    .with_attempts(1))
            })
    }
}

/// Real JS activator that counts how often it is asked to activate
pub struct CountingActivator {
    inner: JsActivator,
    count: AtomicUsize,
}

impl CountingActivator {
    pub fn new(inner: JsActivator) -> Self {
        Self {
            inner,
            count: AtomicUsize::new(0),
        }
    }

    pub fn activations(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Activator for CountingActivator {
    async fn activate(
        &self,
        descriptor: &PluginDescriptor,
        digest: &str,
        source: ValidatedSource,
    ) -> Result<PluginInstance> {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.inner.activate(descriptor, digest, source).await
    }
}

/// Pure Rust source for registry and instance tests
pub struct StubSource {
    id: String,
    capabilities: Capabilities,
}

impl StubSource {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            capabilities: Capabilities {
                search: true,
                ..Default::default()
            },
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

fn item(id: &str) -> Item {
    Item {
        id: id.to_string(),
        title: id.to_string(),
        url: None,
        cover_url: None,
        description: None,
        authors: vec![],
        tags: vec![],
        status: None,
        number: None,
        updated_at: None,
        extra: HashMap::new(),
    }
}

#[async_trait]
impl SourcePlugin for StubSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn search(&self, query: &str, _options: &ListOptions) -> Result<Vec<Item>> {
        Ok(vec![item(query)])
    }

    async fn get_details(&self, id: &str) -> Result<Item> {
        Ok(item(id))
    }

    async fn get_children(&self, _parent_id: &str) -> Result<Vec<Item>> {
        Ok(vec![])
    }

    async fn get_leaf_assets(&self, _child_id: &str) -> Result<Vec<Asset>> {
        Ok(vec![])
    }

    async fn list_all(&self, _options: &ListOptions) -> Result<Vec<Item>> {
        Ok(vec![])
    }

    async fn extract_pagination_info(&self, _url: &str) -> Result<PaginationInfo> {
        Ok(PaginationInfo::default())
    }

    async fn get_latest(&self, _options: &ListOptions) -> Result<Vec<Item>> {
        if self.capabilities.latest {
            Ok(vec![item("latest")])
        } else {
            Err(SourceError::Unsupported {
                id: self.id.clone(),
                capability: super::types::Capability::Latest,
            })
        }
    }
}

/// Instance backed by a `StubSource`
pub fn stub_instance(id: &str, version: &str, capabilities: Capabilities) -> PluginInstance {
    let mut descriptor = sample_descriptor(id, version, "https://cdn.test/stub.js", id.as_bytes());
    descriptor.capabilities = capabilities;
    let source = std::sync::Arc::new(StubSource::new(id).with_capabilities(capabilities));
    PluginInstance::new(&descriptor, sha256_hex(id.as_bytes()), source)
}
