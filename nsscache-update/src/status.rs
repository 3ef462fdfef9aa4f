//! Per-map freshness report for `nsscache status`.
//!
//! Signal precedence:
//! 1. `NeverUpdated` (no watermark)
//! 2. `Missing` (watermark exists, primary file gone)
//! 3. `Modified` (primary digest differs from the one recorded at publish)
//! 4. `Stale` (update or full-update interval exceeded)
//! 5. `Current`

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use nsscache_cache::{Cache, CacheBackend, CacheError};
use nsscache_core::{Config, MapKind, MapOptions};

use crate::error::CheckError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Freshness {
    NeverUpdated,
    Current,
    Stale { reason: String },
    Missing,
    Modified,
}

impl fmt::Display for Freshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Freshness::NeverUpdated => f.write_str("never updated"),
            Freshness::Current => f.write_str("current"),
            Freshness::Stale { reason } => write!(f, "stale ({reason})"),
            Freshness::Missing => f.write_str("missing"),
            Freshness::Modified => f.write_str("modified"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MapStatus {
    pub map: MapKind,
    pub cache_path: PathBuf,
    pub last_full_update: Option<DateTime<Utc>>,
    pub last_incremental_update: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub source_marker: Option<DateTime<Utc>>,
    /// Records in the active generation; `None` when it cannot be read.
    pub records: Option<usize>,
    pub freshness: Freshness,
}

/// Intervals that decide staleness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intervals {
    pub incremental: Duration,
    pub full: Duration,
}

impl From<&Config> for Intervals {
    fn from(config: &Config) -> Self {
        Self {
            incremental: config.incremental_update_interval,
            full: config.full_update_interval,
        }
    }
}

/// Status of one configured map. Read-only; takes no lock.
pub fn map_status(config: &Config, options: &MapOptions) -> Result<MapStatus, CheckError> {
    let cache = CacheBackend::open(
        options.kind,
        &options.cache,
        config.timestamp_dir_for(options),
    )?;
    Ok(check(&cache, Intervals::from(config))?)
}

/// Status of one map within a report, or why it could not be read.
#[derive(Debug)]
pub struct MapCheck {
    pub map: MapKind,
    pub result: Result<MapStatus, CheckError>,
}

/// Status for every map in `maps`, in order.
///
/// Only an invalid selection fails the whole call; a map whose cache
/// cannot be read is reported in its own [`MapCheck`].
pub fn status(config: &Config, maps: &[MapKind]) -> Result<Vec<MapCheck>, CheckError> {
    let mut out = Vec::new();
    for kind in config.select(maps)? {
        if let Some(options) = config.map(kind) {
            let result = map_status(config, options);
            if let Err(err) = &result {
                tracing::warn!(map = %kind, "status check failed: {err}");
            }
            out.push(MapCheck { map: kind, result });
        }
    }
    Ok(out)
}

pub fn check<C: Cache>(cache: &C, intervals: Intervals) -> Result<MapStatus, CacheError> {
    let watermark = cache.read_watermark()?;
    let records = match cache.read_active() {
        Ok(active) => Some(active.map.len()),
        Err(CacheError::NotFound { .. }) | Err(CacheError::Corrupt { .. }) => None,
        Err(e) => return Err(e),
    };
    let active_digest = cache.active_digest()?;

    let freshness = match &watermark {
        None => Freshness::NeverUpdated,
        Some(_) if active_digest.is_none() => Freshness::Missing,
        Some(wm) if wm.digest.is_some() && wm.digest != active_digest => Freshness::Modified,
        Some(wm) => staleness(wm.last_update, wm.last_full_update, intervals),
    };

    let wm = watermark.unwrap_or_default();
    Ok(MapStatus {
        map: cache.kind(),
        cache_path: cache.primary_path(),
        last_full_update: wm.last_full_update,
        last_incremental_update: wm.last_incremental_update,
        last_update: wm.last_update,
        source_marker: wm.source_marker,
        records,
        freshness,
    })
}

fn staleness(
    last_update: Option<DateTime<Utc>>,
    last_full: Option<DateTime<Utc>>,
    intervals: Intervals,
) -> Freshness {
    let Some(last_update) = last_update.or(last_full) else {
        return Freshness::NeverUpdated;
    };
    let age = age_seconds(last_update);
    if age > intervals.incremental.as_secs() {
        return Freshness::Stale {
            reason: format!("last update {} ago", format_seconds(age)),
        };
    }
    match last_full {
        Some(full) if age_seconds(full) > intervals.full.as_secs() => Freshness::Stale {
            reason: format!("last full update {} ago", format_seconds(age_seconds(full))),
        },
        None => Freshness::Stale {
            reason: "no full update recorded".to_string(),
        },
        _ => Freshness::Current,
    }
}

fn age_seconds(ts: DateTime<Utc>) -> u64 {
    Utc::now().signed_duration_since(ts).num_seconds().max(0) as u64
}

/// Format age from a timestamp (e.g. `"3h"`).
pub fn format_age(ts: DateTime<Utc>) -> String {
    format_seconds(age_seconds(ts))
}

pub fn format_seconds(seconds: u64) -> String {
    if seconds < 60 {
        return format!("{seconds}s");
    }
    if seconds < 60 * 60 {
        return format!("{}m", seconds / 60);
    }
    if seconds < 60 * 60 * 24 {
        return format!("{}h", seconds / (60 * 60));
    }
    format!("{}d", seconds / (60 * 60 * 24))
}
