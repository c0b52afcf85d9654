//! Pipeline registry with capability-based discovery
//!
//! Maintains the mapping of pipeline names to factories and metadata,
//! lazily instantiates pipelines on first use, and answers discovery
//! queries (capability/category/tag lookups and weighted free-text search).

use crate::pipeline::{validate_name, Pipeline, PipelineFactory, PipelineMetadata};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// A live, lazily-created pipeline instance
struct LiveInstance {
    pipeline: Arc<dyn Pipeline>,
    config: Value,
    created_at: DateTime<Utc>,
}

/// Registry entry: factory + immutable metadata + optional live instance
struct RegistryEntry {
    factory: Arc<dyn PipelineFactory>,
    metadata: Arc<PipelineMetadata>,
    instance: Option<LiveInstance>,
}

/// Public snapshot of a registered pipeline
#[derive(Debug, Clone, Serialize)]
pub struct PipelineInfo {
    /// Registered name
    pub name: String,
    /// Registration metadata
    pub metadata: Arc<PipelineMetadata>,
    /// Whether a live instance currently exists
    pub instantiated: bool,
    /// Creation time of the live instance, if any
    pub instance_created_at: Option<DateTime<Utc>>,
}

/// One search result with its relevance score
#[derive(Debug, Clone)]
pub struct SearchHit {
    /// Registered pipeline name
    pub name: String,
    /// Relevance score (higher is better)
    pub score: u32,
    /// Registration metadata
    pub metadata: Arc<PipelineMetadata>,
}

/// Registry of pipeline factories with capability-based discovery
///
/// Lookups are frequent and registrations rare, so entries live behind a
/// single `RwLock`. Factories are synchronous and cheap relative to
/// inference, so instance creation runs under the write lock.
pub struct PipelineRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
}

impl PipelineRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register a pipeline factory under a unique name
    ///
    /// Fails with `Error::DuplicateName` if the name is taken and `override_existing`
    /// is false. An override replaces the entry; the caller is responsible for
    /// cleaning up any instance obtained from the replaced registration.
    pub fn register(
        &self,
        name: &str,
        factory: Arc<dyn PipelineFactory>,
        metadata: PipelineMetadata,
        override_existing: bool,
    ) -> Result<()> {
        validate_name(name)?;
        let mut entries = self.entries.write();
        if entries.contains_key(name) && !override_existing {
            return Err(Error::DuplicateName(name.to_string()));
        }
        entries.insert(
            name.to_string(),
            RegistryEntry {
                factory,
                metadata: Arc::new(metadata),
                instance: None,
            },
        );
        tracing::info!(pipeline = name, "pipeline registered");
        Ok(())
    }

    /// Unregister a pipeline, destroying any live instance
    ///
    /// Fails with `Error::NotFound` if the name is absent. The instance's
    /// `cleanup()` runs after the registry lock is released.
    pub async fn unregister(&self, name: &str) -> Result<()> {
        let removed = {
            let mut entries = self.entries.write();
            entries.remove(name)
        };
        let entry = removed.ok_or_else(|| Error::NotFound(name.to_string()))?;
        if let Some(live) = entry.instance {
            if let Err(e) = live.pipeline.cleanup().await {
                tracing::warn!(pipeline = name, error = %e, "cleanup failed during unregister");
            }
        }
        tracing::info!(pipeline = name, "pipeline unregistered");
        Ok(())
    }

    /// Get the live instance for `name`, creating it on first use
    ///
    /// The instance is cached together with the config it was created from
    /// and its creation timestamp. Subsequent calls return the cached
    /// instance regardless of `config`.
    pub fn get_or_create(&self, name: &str, config: &Value) -> Result<Arc<dyn Pipeline>> {
        {
            let entries = self.entries.read();
            let entry = entries
                .get(name)
                .ok_or_else(|| Error::NotFound(name.to_string()))?;
            if let Some(live) = &entry.instance {
                return Ok(live.pipeline.clone());
            }
        }

        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        // A racing caller may have instantiated between the two locks.
        if let Some(live) = &entry.instance {
            return Ok(live.pipeline.clone());
        }
        let pipeline = entry.factory.create(config)?;
        entry.instance = Some(LiveInstance {
            pipeline: pipeline.clone(),
            config: config.clone(),
            created_at: Utc::now(),
        });
        tracing::debug!(pipeline = name, "pipeline instance created");
        Ok(pipeline)
    }

    /// Destroy every live instance, keeping registrations intact
    pub async fn cleanup_all(&self) {
        let instances: Vec<(String, Arc<dyn Pipeline>)> = {
            let mut entries = self.entries.write();
            entries
                .iter_mut()
                .filter_map(|(name, entry)| {
                    entry.instance.take().map(|live| (name.clone(), live.pipeline))
                })
                .collect()
        };
        for (name, pipeline) in instances {
            if let Err(e) = pipeline.cleanup().await {
                tracing::warn!(pipeline = %name, error = %e, "cleanup failed");
            }
        }
    }

    /// List all registered pipeline names, sorted
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Get the registration snapshot for a pipeline
    pub fn get_info(&self, name: &str) -> Result<PipelineInfo> {
        let entries = self.entries.read();
        let entry = entries
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        Ok(PipelineInfo {
            name: name.to_string(),
            metadata: entry.metadata.clone(),
            instantiated: entry.instance.is_some(),
            instance_created_at: entry.instance.as_ref().map(|l| l.created_at),
        })
    }

    /// Metadata for a pipeline, if registered
    pub fn metadata(&self, name: &str) -> Option<Arc<PipelineMetadata>> {
        self.entries.read().get(name).map(|e| e.metadata.clone())
    }

    /// The config the live instance was created from, if instantiated
    pub fn instance_config(&self, name: &str) -> Option<Value> {
        self.entries
            .read()
            .get(name)
            .and_then(|e| e.instance.as_ref())
            .map(|l| l.config.clone())
    }

    /// Names of pipelines providing an exact capability
    pub fn find_by_capability(&self, capability: &str) -> Vec<String> {
        self.find_matching(|m| m.capabilities.iter().any(|c| c == capability))
    }

    /// Names of pipelines providing every capability in `required`
    pub fn find_by_capabilities(&self, required: &[String]) -> Vec<String> {
        self.find_matching(|m| m.provides_all(required))
    }

    /// Names of pipelines in an exact category
    pub fn find_by_category(&self, category: &str) -> Vec<String> {
        self.find_matching(|m| m.category == category)
    }

    /// Names of pipelines carrying all of the given tags
    pub fn find_by_tags(&self, tags: &[String]) -> Vec<String> {
        self.find_matching(|m| tags.iter().all(|t| m.tags.iter().any(|mt| mt == t)))
    }

    fn find_matching<F: Fn(&PipelineMetadata) -> bool>(&self, pred: F) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|(_, e)| pred(&e.metadata))
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    /// Weighted free-text search over names, descriptions, tags, and capabilities
    ///
    /// Scoring: name match 10, description match 5, each matching tag 2, each
    /// matching capability 3, plus one point per raw substring occurrence in
    /// any text field (category and author included). Case-insensitive.
    /// Results sort by descending relevance, then ascending name.
    pub fn search(&self, query: &str) -> Vec<SearchHit> {
        let q = query.to_lowercase();
        if q.is_empty() {
            return Vec::new();
        }
        let mut hits: Vec<SearchHit> = self
            .entries
            .read()
            .iter()
            .filter_map(|(name, entry)| {
                let score = relevance(name, &entry.metadata, &q);
                (score > 0).then(|| SearchHit {
                    name: name.clone(),
                    score,
                    metadata: entry.metadata.clone(),
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.name.cmp(&b.name)));
        hits
    }

    /// Sorted union of all categories across registered pipelines
    pub fn categories(&self) -> Vec<String> {
        self.collect_union(|m| std::iter::once(m.category.clone()).collect())
    }

    /// Sorted union of all capabilities across registered pipelines
    pub fn capabilities(&self) -> Vec<String> {
        self.collect_union(|m| m.capabilities.clone())
    }

    /// Sorted union of all tags across registered pipelines
    pub fn tags(&self) -> Vec<String> {
        self.collect_union(|m| m.tags.clone())
    }

    fn collect_union<F: Fn(&PipelineMetadata) -> Vec<String>>(&self, f: F) -> Vec<String> {
        let set: BTreeSet<String> = self
            .entries
            .read()
            .values()
            .flat_map(|e| f(&e.metadata))
            .filter(|s| !s.is_empty())
            .collect();
        set.into_iter().collect()
    }

    /// Number of registered pipelines
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for PipelineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Count non-overlapping occurrences of `needle` in `haystack`
fn occurrences(haystack: &str, needle: &str) -> u32 {
    if needle.is_empty() {
        return 0;
    }
    let mut count = 0;
    let mut rest = haystack;
    while let Some(pos) = rest.find(needle) {
        count += 1;
        rest = &rest[pos + needle.len()..];
    }
    count
}

fn relevance(name: &str, metadata: &PipelineMetadata, q: &str) -> u32 {
    let name_l = name.to_lowercase();
    let desc_l = metadata.description.to_lowercase();
    let cat_l = metadata.category.to_lowercase();
    let author_l = metadata.author.to_lowercase();

    let mut score = 0;
    if name_l.contains(q) {
        score += 10;
    }
    if desc_l.contains(q) {
        score += 5;
    }
    for tag in &metadata.tags {
        let tag_l = tag.to_lowercase();
        if tag_l.contains(q) {
            score += 2;
        }
        score += occurrences(&tag_l, q);
    }
    for cap in &metadata.capabilities {
        let cap_l = cap.to_lowercase();
        if cap_l.contains(q) {
            score += 3;
        }
        score += occurrences(&cap_l, q);
    }
    score += occurrences(&name_l, q);
    score += occurrences(&desc_l, q);
    score += occurrences(&cat_l, q);
    score += occurrences(&author_l, q);
    score
}
