//! Read-only consistency checks: `verify` and `diff`.
//!
//! Neither function takes the map lock or writes anything; drift is
//! reported, never repaired.

use serde::Serialize;
use similar::TextDiff;

use nsscache_cache::{Cache, CacheBackend, CacheError};
use nsscache_core::{Config, MapData, MapKind, MapOptions};
use nsscache_source::{Source, SourceBackend};

use crate::error::CheckError;

/// Default number of keys sampled in each direction.
pub const DEFAULT_SAMPLE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub map: MapKind,
    /// `None` when there is no readable active generation.
    pub cache_records: Option<usize>,
    pub source_records: usize,
    pub sampled: usize,
    /// Sampled source keys absent from the cache.
    pub missing_in_cache: Vec<String>,
    /// Sampled keys present in both with different content.
    pub differing: Vec<String>,
    /// Sampled cache keys the source no longer has.
    pub missing_in_source: Vec<String>,
    pub index_problems: Vec<String>,
}

impl VerifyReport {
    pub fn is_consistent(&self) -> bool {
        self.cache_records == Some(self.source_records)
            && self.missing_in_cache.is_empty()
            && self.differing.is_empty()
            && self.missing_in_source.is_empty()
            && self.index_problems.is_empty()
    }
}

/// Compare the active generation of `cache` with a fresh full fetch.
pub fn verify<S: Source, C: Cache>(
    source: &S,
    cache: &C,
    sample: usize,
) -> Result<VerifyReport, CheckError> {
    let kind = cache.kind();
    let snapshot = source.fetch_all()?;
    let remote = MapData::from_records(kind, snapshot.records)?;

    let (local, index_problems) = match cache.read_active() {
        Ok(active) => (Some(active.map), cache.verify_indexes()?),
        Err(e @ CacheError::NotFound { .. }) | Err(e @ CacheError::Corrupt { .. }) => {
            (None, vec![e.to_string()])
        }
        Err(e) => return Err(e.into()),
    };
    let empty = MapData::new(kind);
    let local_map = local.as_ref().unwrap_or(&empty);

    let remote_names: Vec<&str> = remote.names().collect();
    let mut missing_in_cache = Vec::new();
    let mut differing = Vec::new();
    for name in evenly_spaced(&remote_names, sample) {
        match local_map.get(name) {
            None => missing_in_cache.push(name.to_string()),
            Some(record) if Some(record) != remote.get(name) => differing.push(name.to_string()),
            Some(_) => {}
        }
    }

    let local_names: Vec<&str> = local_map.names().collect();
    let missing_in_source = evenly_spaced(&local_names, sample)
        .into_iter()
        .filter(|name| !remote.contains(name))
        .map(str::to_string)
        .collect();

    let report = VerifyReport {
        map: kind,
        cache_records: local.as_ref().map(MapData::len),
        source_records: remote.len(),
        sampled: remote_names.len().min(sample),
        missing_in_cache,
        differing,
        missing_in_source,
        index_problems,
    };
    if report.is_consistent() {
        tracing::info!(map = %kind, records = remote.len(), "cache matches source");
    } else {
        tracing::warn!(map = %kind, "cache has drifted from source");
    }
    Ok(report)
}

/// `verify` for one configured map.
pub fn verify_map(config: &Config, options: &MapOptions, sample: usize) -> Result<VerifyReport, CheckError> {
    let (source, cache) = open(config, options)?;
    verify(&source, &cache, sample)
}

/// Unified diff between the active primary file and what a full update
/// would publish now. Empty when identical.
pub fn diff<S: Source, C: Cache>(source: &S, cache: &C) -> Result<String, CheckError> {
    let kind = cache.kind();
    let snapshot = source.fetch_all()?;
    let map = MapData::from_records(kind, snapshot.records)?;
    let rendered = cache.render(&map);

    let existing = match cache.read_primary() {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(CacheError::NotFound { .. }) => String::new(),
        Err(e) => return Err(e.into()),
    };
    if existing == rendered {
        return Ok(String::new());
    }

    let path = cache.primary_path();
    let old_header = format!("a/{}", path.display());
    let new_header = format!("b/{}", path.display());
    Ok(TextDiff::from_lines(&existing, &rendered)
        .unified_diff()
        .header(&old_header, &new_header)
        .context_radius(3)
        .to_string())
}

/// `diff` for one configured map.
pub fn diff_map(config: &Config, options: &MapOptions) -> Result<String, CheckError> {
    let (source, cache) = open(config, options)?;
    diff(&source, &cache)
}

fn open(config: &Config, options: &MapOptions) -> Result<(SourceBackend, CacheBackend), CheckError> {
    let source = SourceBackend::open(options.kind, &options.source)?;
    let cache = CacheBackend::open(
        options.kind,
        &options.cache,
        config.timestamp_dir_for(options),
    )?;
    Ok((source, cache))
}

/// Up to `n` items spread evenly across `items`, first item included.
fn evenly_spaced<'a>(items: &[&'a str], n: usize) -> Vec<&'a str> {
    if items.len() <= n {
        return items.to_vec();
    }
    (0..n).map(|i| items[i * items.len() / n]).collect()
}
