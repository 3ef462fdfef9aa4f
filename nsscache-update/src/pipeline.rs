//! Shared update entrypoint used by `nsscache update` and `nsscache repair`.
//!
//! Each requested map runs on its own blocking worker inside a Tokio
//! multi-thread runtime and takes its own lock, so one slow or failing map
//! never holds up another.

use std::sync::Arc;

use serde::Serialize;

use nsscache_cache::CacheBackend;
use nsscache_core::{Config, ConfigError, MapKind};
use nsscache_source::SourceBackend;

use crate::engine::{CancelToken, EngineSettings, UpdateEngine, UpdateOptions, UpdateReport};
use crate::error::{Cause, Stage, UpdateError};
use crate::lock::MapLock;

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// Process outcome of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Success,
    /// Some maps updated, others failed.
    PartialFailure,
    /// Every attempted map failed.
    TotalFailure,
    /// Nothing failed but at least one map was skipped as busy.
    LockContention,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::PartialFailure => 1,
            ExitStatus::TotalFailure => 2,
            ExitStatus::LockContention => 200,
        }
    }
}

/// Outcome of one map within a run.
#[derive(Debug)]
pub struct MapResult {
    pub map: MapKind,
    pub result: Result<UpdateReport, UpdateError>,
}

/// Per-map results, in the order requested.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub results: Vec<MapResult>,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.result.is_ok()).count()
    }

    pub fn busy(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(&r.result, Err(e) if e.is_lock_busy()))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded() - self.busy()
    }

    pub fn exit_status(&self) -> ExitStatus {
        match (self.failed(), self.succeeded(), self.busy()) {
            (0, _, 0) => ExitStatus::Success,
            (0, _, _) => ExitStatus::LockContention,
            (_, 0, _) => ExitStatus::TotalFailure,
            _ => ExitStatus::PartialFailure,
        }
    }
}

// ---------------------------------------------------------------------------
// Single map
// ---------------------------------------------------------------------------

/// Lock, update and unlock one configured map.
pub fn update_map(
    config: &Config,
    kind: MapKind,
    options: UpdateOptions,
    cancel: &CancelToken,
) -> Result<UpdateReport, UpdateError> {
    let map = config.map(kind).ok_or_else(|| {
        UpdateError::new(
            kind,
            Stage::Locked,
            ConfigError::Invalid(format!("map '{kind}' is not configured")),
        )
    })?;

    let _lock = MapLock::acquire(&config.lock_dir, kind, config.lock_timeout)
        .map_err(|e| UpdateError::new(kind, Stage::Locked, e))?;

    let source = SourceBackend::open(kind, &map.source)
        .map_err(|e| UpdateError::new(kind, Stage::Locked, e))?;
    let cache = CacheBackend::open(kind, &map.cache, config.timestamp_dir_for(map))
        .map_err(|e| UpdateError::new(kind, Stage::Locked, e))?;
    tracing::debug!(map = %kind, source = source.backend_name(), "opened back ends");

    UpdateEngine::new(source, cache, EngineSettings::from(config))
        .with_cancel(cancel.clone())
        .run(options)
}

// ---------------------------------------------------------------------------
// Many maps
// ---------------------------------------------------------------------------

/// Update every map in `maps` in parallel, blocking until all finish.
///
/// Ctrl-C sets `cancel`; maps already publishing still complete.
pub fn update_maps(
    config: Arc<Config>,
    maps: &[MapKind],
    options: UpdateOptions,
    cancel: CancelToken,
) -> std::io::Result<RunSummary> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    Ok(runtime.block_on(run(config, maps.to_vec(), options, cancel)))
}

/// Async body of [`update_maps`], for callers that already own a runtime.
pub async fn run(
    config: Arc<Config>,
    maps: Vec<MapKind>,
    options: UpdateOptions,
    cancel: CancelToken,
) -> RunSummary {
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("received ctrl-c, cancelling updates");
                cancel.cancel();
            }
        })
    };

    let handles: Vec<_> = maps
        .into_iter()
        .map(|kind| {
            let config = Arc::clone(&config);
            let cancel = cancel.clone();
            let handle = tokio::task::spawn_blocking(move || {
                update_map(&config, kind, options, &cancel)
            });
            (kind, handle)
        })
        .collect();

    let mut summary = RunSummary::default();
    for (kind, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(err) => Err(UpdateError::new(
                kind,
                Stage::Publishing,
                Cause::Worker(err.to_string()),
            )),
        };
        if let Err(err) = &result {
            tracing::error!(map = %kind, kind = %err.kind(), "{err}");
        }
        summary.results.push(MapResult { map: kind, result });
    }

    interrupt.abort();
    summary
}
