//! Per-country mapping of event-source region names onto boundary-file names.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cpaor_adapters::load_adm1_names;
use cpaor_storage::{read_json_if_present, write_json_pretty};
use tracing::{debug, info};

use crate::matcher::{find_maximum_matches, SIMILARITY_FLOOR};

/// country -> (raw region name -> boundary region name)
pub type LocationMapping = BTreeMap<String, BTreeMap<String, String>>;

/// Strategy turning two vocabularies into `source -> target` pairs.
/// Unresolved source names are simply absent from the result.
#[async_trait]
pub trait NameResolver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn resolve(
        &self,
        country: &str,
        source: &[String],
        target: &[String],
    ) -> Result<BTreeMap<String, String>>;
}

#[derive(Debug, Clone)]
pub struct GreedySimilarityResolver {
    floor: f64,
}

impl Default for GreedySimilarityResolver {
    fn default() -> Self {
        Self {
            floor: SIMILARITY_FLOOR,
        }
    }
}

#[async_trait]
impl NameResolver for GreedySimilarityResolver {
    fn name(&self) -> &'static str {
        "greedy-similarity"
    }

    async fn resolve(
        &self,
        _country: &str,
        source: &[String],
        target: &[String],
    ) -> Result<BTreeMap<String, String>> {
        Ok(find_maximum_matches(source.to_vec(), target.to_vec(), self.floor).matches)
    }
}

pub struct LocationMappingBuilder {
    cache_path: PathBuf,
    boundaries_dir: PathBuf,
    primary: Box<dyn NameResolver>,
    fallback: Option<Box<dyn NameResolver>>,
}

impl LocationMappingBuilder {
    pub fn new(cache_path: impl Into<PathBuf>, boundaries_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_path: cache_path.into(),
            boundaries_dir: boundaries_dir.into(),
            primary: Box::<GreedySimilarityResolver>::default(),
            fallback: None,
        }
    }

    pub fn with_primary(mut self, resolver: Box<dyn NameResolver>) -> Self {
        self.primary = resolver;
        self
    }

    /// Second resolver, run only over names the primary left unmatched.
    pub fn with_fallback(mut self, resolver: Box<dyn NameResolver>) -> Self {
        self.fallback = Some(resolver);
        self
    }

    /// A cached mapping, if the cache file exists and is non-empty.
    pub async fn load_cached(&self) -> Result<Option<LocationMapping>> {
        read_json_if_present(&self.cache_path).await
    }

    /// Returns the cached mapping untouched when there is one. Otherwise maps
    /// every country in turn, rewriting the cache after each so completed
    /// countries survive a later failure. A missing boundary file aborts.
    pub async fn build(
        &self,
        countries: &[String],
        source_names: &BTreeMap<String, Vec<String>>,
    ) -> Result<LocationMapping> {
        if let Some(cached) = self.load_cached().await? {
            debug!(path = %self.cache_path.display(), "using cached location mapping");
            return Ok(cached);
        }

        let mut mapping = LocationMapping::new();
        for country in countries {
            let names = source_names.get(country).map(Vec::as_slice).unwrap_or_default();
            let country_mapping = self.map_country(country, names).await?;
            info!(
                country = %country,
                source_names = names.len(),
                mapped = country_mapping.len(),
                "location mapping built"
            );
            mapping.insert(country.clone(), country_mapping);
            write_json_pretty(&self.cache_path, &mapping).await?;
        }
        Ok(mapping)
    }

    /// Names already spelled as in the boundary file map to themselves; the
    /// rest go to the primary resolver, then the fallback.
    pub async fn map_country(
        &self,
        country: &str,
        source_names: &[String],
    ) -> Result<BTreeMap<String, String>> {
        let boundary_names = load_adm1_names(&self.boundaries_dir, country)?;
        let boundary_set: BTreeSet<&str> = boundary_names.iter().map(String::as_str).collect();

        let mut mapping = BTreeMap::new();
        let mut pending = Vec::new();
        let mut seen = BTreeSet::new();
        for name in source_names {
            if !seen.insert(name.as_str()) {
                continue;
            }
            if boundary_set.contains(name.as_str()) {
                mapping.insert(name.clone(), name.clone());
            } else {
                pending.push(name.clone());
            }
        }
        let targets: Vec<String> = boundary_names
            .iter()
            .filter(|n| !mapping.contains_key(n.as_str()))
            .cloned()
            .collect();

        let resolved = self
            .primary
            .resolve(country, &pending, &targets)
            .await
            .with_context(|| format!("{} resolver failed for {country}", self.primary.name()))?;
        mapping.extend(resolved);

        if let Some(fallback) = &self.fallback {
            let used: BTreeSet<&String> = mapping.values().collect();
            let leftover_targets: Vec<String> = targets
                .iter()
                .filter(|t| !used.contains(t))
                .cloned()
                .collect();
            let leftover_sources: Vec<String> = pending
                .iter()
                .filter(|s| !mapping.contains_key(s.as_str()))
                .cloned()
                .collect();
            if !leftover_sources.is_empty() && !leftover_targets.is_empty() {
                let extra = fallback
                    .resolve(country, &leftover_sources, &leftover_targets)
                    .await
                    .with_context(|| format!("{} resolver failed for {country}", fallback.name()))?;
                mapping.extend(extra);
            }
        }
        Ok(mapping)
    }
}

/// Rewrites `name` through the country's mapping; unmapped names pass through.
pub fn apply_mapping<'a>(mapping: Option<&'a BTreeMap<String, String>>, name: &'a str) -> &'a str {
    mapping
        .and_then(|m| m.get(name))
        .map(String::as_str)
        .unwrap_or(name)
}
