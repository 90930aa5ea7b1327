//! Asset metadata cache and resolver.
//!
//! The cache is created once at process start and injected into every
//! component that needs asset lookups. It is written only by the metadata
//! resolution step and read everywhere else; entries are never evicted or
//! invalidated (asset metadata is immutable once defined).

use crate::agcommon::error::Result;
use crate::agcommon::models::AssetMetadataEntry;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::info;

/// Process-wide asset id -> {name, decimals} mapping.
pub struct AssetCache {
    entries: RwLock<HashMap<String, AssetMetadataEntry>>,
}

impl AssetCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, asset: &str) -> Option<AssetMetadataEntry> {
        self.entries.read().unwrap().get(asset).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Merge freshly resolved entries into the cache.
    pub fn merge(&self, resolved: HashMap<String, AssetMetadataEntry>) {
        if resolved.is_empty() {
            return;
        }
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.extend(resolved);
        info!("asset metadata cache grew from {} to {} entries", before, entries.len());
    }

    /// Of the given asset ids, those not yet cached. Used to build the batch
    /// resolver call of an aggregation pass.
    pub fn missing_from<'a, I>(&self, assets: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let entries = self.entries.read().unwrap();
        let mut missing: Vec<String> = assets
            .into_iter()
            .filter(|a| !entries.contains_key(*a))
            .map(|a| a.to_string())
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }

    /// Display name for an asset id; falls back to the id itself.
    pub fn display_name(&self, asset: &str) -> String {
        self.get(asset).map(|m| m.name).unwrap_or_else(|| asset.to_string())
    }

    /// Resolve an API-supplied asset parameter, which may be a display name
    /// or a raw id, back to the id. Unknown values pass through unchanged.
    pub fn resolve_id(&self, name_or_id: &str) -> String {
        let entries = self.entries.read().unwrap();
        if entries.contains_key(name_or_id) {
            return name_or_id.to_string();
        }
        for (id, meta) in entries.iter() {
            if meta.name == name_or_id {
                return id.clone();
            }
        }
        name_or_id.to_string()
    }
}

impl Default for AssetCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Batch metadata lookup service. `assets = None` means "everything known",
/// used to warm the cache at startup; an empty list resolves to nothing.
#[async_trait]
pub trait AssetMetadataResolver: Send + Sync {
    async fn resolve(&self, assets: Option<&[String]>) -> Result<HashMap<String, AssetMetadataEntry>>;
}

/// Resolver backed by an HTTP metadata service.
pub struct HttpMetadataResolver {
    client: reqwest::Client,
    url: String,
}

impl HttpMetadataResolver {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl AssetMetadataResolver for HttpMetadataResolver {
    async fn resolve(&self, assets: Option<&[String]>) -> Result<HashMap<String, AssetMetadataEntry>> {
        if let Some(list) = assets {
            if list.is_empty() {
                return Ok(HashMap::new());
            }
        }
        let body = serde_json::json!({ "assets": assets });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let resolved: HashMap<String, AssetMetadataEntry> = response.json().await?;
        Ok(resolved)
    }
}
