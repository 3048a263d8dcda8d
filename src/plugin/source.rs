//! Source plugin contract
//!
//! Every activated plugin is exposed to the host through the `SourcePlugin`
//! trait. The six mandatory operations walk a source's content tree:
//! - Searching and listing top-level items
//! - Retrieving item details
//! - Listing an item's children (chapters, episodes...)
//! - Resolving a child into leaf assets (pages, streams...)
//! - Reading pagination information from a listing URL
//!
//! Listing variants (`latest`, `popular`, `trending`) are optional and fail
//! with `Unsupported` unless the plugin both declares and implements them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::error::{Result, SourceError};
use super::types::{Capabilities, Capability};

/// Contract implemented by every live source plugin
#[async_trait]
pub trait SourcePlugin: Send + Sync {
    /// Plugin identifier, used in errors and logs
    fn id(&self) -> &str;

    /// Optional capabilities the live implementation actually provides
    fn capabilities(&self) -> Capabilities;

    /// Search the source by free text
    async fn search(&self, query: &str, options: &ListOptions) -> Result<Vec<Item>>;

    /// Full details for one item
    async fn get_details(&self, id: &str) -> Result<Item>;

    /// Children of an item, in source order
    async fn get_children(&self, parent_id: &str) -> Result<Vec<Item>>;

    /// Leaf assets of a child item
    async fn get_leaf_assets(&self, child_id: &str) -> Result<Vec<Asset>>;

    /// Browse the whole source
    async fn list_all(&self, options: &ListOptions) -> Result<Vec<Item>>;

    /// Pagination state encoded in a listing URL
    async fn extract_pagination_info(&self, url: &str) -> Result<PaginationInfo>;

    async fn get_latest(&self, _options: &ListOptions) -> Result<Vec<Item>> {
        Err(self.unsupported(Capability::Latest))
    }

    async fn get_popular(&self, _options: &ListOptions) -> Result<Vec<Item>> {
        Err(self.unsupported(Capability::Popular))
    }

    async fn get_trending(&self, _options: &ListOptions) -> Result<Vec<Item>> {
        Err(self.unsupported(Capability::Trending))
    }

    /// Release engine resources held by the plugin
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    fn unsupported(&self, capability: Capability) -> SourceError {
        SourceError::Unsupported {
            id: self.id().to_string(),
            capability,
        }
    }
}

/// A node of a source's content tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub url: Option<String>,

    #[serde(default, alias = "cover", alias = "thumbnail")]
    pub cover_url: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub authors: Vec<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub status: Option<String>,

    /// Ordinal of a child within its parent (chapter 12.5 and the like)
    #[serde(default)]
    pub number: Option<f64>,

    #[serde(default)]
    pub updated_at: Option<String>,

    /// Source-specific fields passed through untouched
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// A leaf resource (page image, media stream...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    #[serde(default)]
    pub index: u32,

    pub url: String,

    /// Headers the consumer must send when fetching `url`
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationInfo {
    #[serde(default = "default_page")]
    pub current_page: u32,

    #[serde(default)]
    pub total_pages: Option<u32>,

    #[serde(default)]
    pub has_next_page: bool,

    #[serde(default)]
    pub next_url: Option<String>,
}

/// Paging and filter options passed to listing operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOptions {
    #[serde(default = "default_page")]
    pub page: u32,

    #[serde(default)]
    pub limit: Option<u32>,

    #[serde(flatten)]
    pub filters: HashMap<String, serde_json::Value>,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            page: default_page(),
            limit: None,
            filters: HashMap::new(),
        }
    }
}

impl ListOptions {
    pub fn page(page: u32) -> Self {
        Self { page, ..Default::default() }
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.filters.insert(key.into(), value);
        self
    }
}

fn default_page() -> u32 {
    1
}
