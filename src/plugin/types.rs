//! Plugin type definitions
//!
//! Catalog-facing metadata (`PluginDescriptor`), the capability flags a
//! descriptor declares, and the validator's verdict.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core::error::{Result, SourceError};

/// Unique identifier for a plugin, lowercase kebab case
pub type PluginId = String;

lazy_static! {
    static ref ID_PATTERN: Regex = Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").unwrap();
    static ref DIGEST_PATTERN: Regex = Regex::new(r"^[0-9a-fA-F]{64}$").unwrap();
}

/// Optional listing operations a plugin may declare
///
/// `Search` is mandatory in the contract but is still declared by catalogs,
/// so it is tracked like the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Search,
    Latest,
    Popular,
    Trending,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::Search,
        Capability::Latest,
        Capability::Popular,
        Capability::Trending,
    ];

    /// Name of the plugin method that implements this capability
    pub fn method_name(&self) -> &'static str {
        match self {
            Capability::Search => "search",
            Capability::Latest => "getLatest",
            Capability::Popular => "getPopular",
            Capability::Trending => "getTrending",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Search => "search",
            Capability::Latest => "latest",
            Capability::Popular => "popular",
            Capability::Trending => "trending",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Capability {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "search" => Ok(Capability::Search),
            "latest" | "latest-listing" => Ok(Capability::Latest),
            "popular" => Ok(Capability::Popular),
            "trending" => Ok(Capability::Trending),
            other => Err(SourceError::InvalidDescriptor(format!("unknown capability: {}", other))),
        }
    }
}

/// Capability flags, as declared by a descriptor or implemented by a live plugin
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub search: bool,
    pub latest: bool,
    pub popular: bool,
    pub trending: bool,
}

impl Capabilities {
    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::Search => self.search,
            Capability::Latest => self.latest,
            Capability::Popular => self.popular,
            Capability::Trending => self.trending,
        }
    }

    pub fn insert(&mut self, capability: Capability) {
        match capability {
            Capability::Search => self.search = true,
            Capability::Latest => self.latest = true,
            Capability::Popular => self.popular = true,
            Capability::Trending => self.trending = true,
        }
    }

    /// Flags set in both `self` and `other`
    pub fn intersection(&self, other: &Capabilities) -> Capabilities {
        Capabilities {
            search: self.search && other.search,
            latest: self.latest && other.latest,
            popular: self.popular && other.popular,
            trending: self.trending && other.trending,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(move |c| self.has(*c))
    }
}

impl FromIterator<Capability> for Capabilities {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut caps = Capabilities::default();
        for cap in iter {
            caps.insert(cap);
        }
        caps
    }
}

/// Catalog metadata describing where a plugin lives and how to verify it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    pub id: PluginId,

    #[serde(alias = "name")]
    pub display_name: String,

    pub version: String,

    /// Domain the plugin scrapes; never fetched by the loader itself
    #[serde(alias = "baseUrl")]
    pub base_endpoint: String,

    #[serde(alias = "artifactURL", alias = "downloadUrl")]
    pub artifact_url: String,

    /// Hex SHA-256 of the artifact
    #[serde(default, alias = "sha256")]
    pub expected_digest: Option<String>,

    #[serde(default)]
    pub capabilities: Capabilities,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub language: Option<String>,

    #[serde(default)]
    pub icon_url: Option<String>,

    #[serde(default)]
    pub nsfw: bool,

    #[serde(default)]
    pub tags: Vec<String>,
}

impl PluginDescriptor {
    /// Check everything that can be checked without touching the network
    pub fn validate(&self) -> Result<()> {
        if !ID_PATTERN.is_match(&self.id) {
            return Err(SourceError::InvalidDescriptor(format!(
                "id '{}' is not lowercase kebab case",
                self.id
            )));
        }

        if self.version.trim().is_empty() {
            return Err(SourceError::InvalidDescriptor(format!(
                "{}: version is empty",
                self.id
            )));
        }

        match self.expected_digest.as_deref() {
            None => {
                return Err(SourceError::InvalidDescriptor(format!(
                    "{}: expected digest is missing",
                    self.id
                )))
            }
            Some(digest) if !DIGEST_PATTERN.is_match(digest) => {
                return Err(SourceError::InvalidDescriptor(format!(
                    "{}: expected digest must be 64 hex characters",
                    self.id
                )))
            }
            Some(_) => {}
        }

        let parsed = url::Url::parse(&self.artifact_url).map_err(|e| {
            SourceError::InvalidDescriptor(format!("{}: artifact url: {}", self.id, e))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SourceError::InvalidDescriptor(format!(
                "{}: artifact url must use http or https",
                self.id
            )));
        }

        Ok(())
    }

    /// Digest after `validate()` has succeeded
    pub fn digest(&self) -> Result<&str> {
        self.expected_digest
            .as_deref()
            .ok_or_else(|| SourceError::InvalidDescriptor(format!("{}: expected digest is missing", self.id)))
    }

    /// Host part of the base endpoint, tolerating bare domains
    pub fn base_host(&self) -> Option<String> {
        let raw = self.base_endpoint.trim();
        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("https://{}", raw)
        };
        url::Url::parse(&with_scheme)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
    }
}

/// Outcome of static vetting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationVerdict {
    pub ok: bool,
    pub reasons: Vec<String>,
}

impl ValidationVerdict {
    pub fn passed() -> Self {
        Self { ok: true, reasons: Vec::new() }
    }

    pub fn failed(reasons: Vec<String>) -> Self {
        Self { ok: false, reasons }
    }
}
