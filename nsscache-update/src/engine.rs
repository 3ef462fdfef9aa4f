//! The update engine: one map, one run.
//!
//! ```text
//! Idle -> Locked -> Fetching -> Merging -> Publishing -> Idle
//!                      \___________\___________\______-> Failed
//! ```
//!
//! The caller holds the map lock. Every failure before publish leaves the
//! active generation and the watermark untouched; a staged generation that
//! is not published removes itself.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use nsscache_cache::{Cache, CacheError, PublishOutcome, Watermark};
use nsscache_core::{Config, MapData, MapKind, RetryPolicy};
use nsscache_source::{Source, SourceError};

use crate::error::{Cause, Stage, UpdateError};

// ---------------------------------------------------------------------------
// Options, cancellation, report
// ---------------------------------------------------------------------------

/// Caller choices for one update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Skip incremental mode.
    pub force_full: bool,
    /// Publish even when a safety guard would refuse an empty map.
    pub force_write: bool,
}

/// Shared flag checked between stages. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Full,
    Incremental,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Full => "full",
            Mode::Incremental => "incremental",
        })
    }
}

/// Why an update ran in full mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum FullReason {
    Forced,
    NoWatermark,
    FullIntervalElapsed,
    WatermarkTooOld,
    EmptyActive,
    ActiveUnreadable(String),
}

impl fmt::Display for FullReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FullReason::Forced => f.write_str("forced"),
            FullReason::NoWatermark => f.write_str("no previous update"),
            FullReason::FullIntervalElapsed => f.write_str("full update interval elapsed"),
            FullReason::WatermarkTooOld => f.write_str("source cannot serve a delta"),
            FullReason::EmptyActive => f.write_str("active cache is empty"),
            FullReason::ActiveUnreadable(why) => write!(f, "active cache unreadable: {why}"),
        }
    }
}

/// Result of a successful update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    pub map: MapKind,
    pub mode: Mode,
    /// Set whenever `mode` is full.
    pub reason: Option<FullReason>,
    pub outcome: PublishOutcome,
    pub records: usize,
    /// Changes applied (incremental) or records fetched (full).
    pub changes: usize,
    pub marker: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Settings the engine takes from [`Config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub full_update_interval: Duration,
    pub retry: RetryPolicy,
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            full_update_interval: config.full_update_interval,
            retry: config.retry,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Drives one map from its source into its cache.
pub struct UpdateEngine<S, C> {
    source: S,
    cache: C,
    settings: EngineSettings,
    cancel: CancelToken,
}

/// The map to publish plus the facts needed to record it.
struct Plan {
    mode: Mode,
    reason: Option<FullReason>,
    map: MapData,
    changes: usize,
    marker: Option<DateTime<Utc>>,
    previous: Option<Watermark>,
    /// Record count of the generation being replaced.
    previous_len: usize,
}

impl<S: Source, C: Cache> UpdateEngine<S, C> {
    pub fn new(source: S, cache: C, settings: EngineSettings) -> Self {
        Self {
            source,
            cache,
            settings,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn kind(&self) -> MapKind {
        self.cache.kind()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Run one update. The caller must hold the map's lock.
    pub fn run(&self, options: UpdateOptions) -> Result<UpdateReport, UpdateError> {
        let kind = self.kind();
        let started = Instant::now();
        let plan = self.plan(options)?;
        self.guard(&plan, options)?;

        if self.cancel.is_cancelled() {
            return Err(UpdateError::new(kind, Stage::Merging, Cause::Cancelled));
        }

        // Staging touches nothing visible; publishing runs to completion once started.
        let staged = self
            .cache
            .write_generation(&plan.map)
            .map_err(|e| UpdateError::new(kind, Stage::Merging, e))?;
        let publish_err = |e: CacheError| UpdateError::new(kind, Stage::Publishing, e);
        let digest = staged.digest().to_string();
        let outcome = self.cache.publish(staged).map_err(publish_err)?;

        let watermark = self.next_watermark(&plan, digest);
        self.cache
            .commit_watermark(&watermark)
            .map_err(publish_err)?;

        tracing::info!(
            map = %kind,
            mode = %plan.mode,
            records = plan.map.len(),
            changes = plan.changes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "update complete ({outcome:?})"
        );
        Ok(UpdateReport {
            map: kind,
            mode: plan.mode,
            reason: plan.reason,
            outcome,
            records: plan.map.len(),
            changes: plan.changes,
            marker: watermark.source_marker,
        })
    }

    /// Fetching and merging: decide the mode and build the map to publish.
    fn plan(&self, options: UpdateOptions) -> Result<Plan, UpdateError> {
        let kind = self.kind();
        let previous = match self.cache.read_watermark() {
            Ok(wm) => wm,
            Err(e) => {
                tracing::warn!(map = %kind, "ignoring unreadable watermark: {e}");
                None
            }
        };

        let reason = match self.full_reason(options, previous.as_ref()) {
            Some(reason) => reason,
            None => match self.try_incremental(previous.as_ref())? {
                Ok(mut plan) => {
                    plan.previous = previous;
                    return Ok(plan);
                }
                Err(reason) => reason,
            },
        };

        tracing::info!(map = %kind, reason = %reason, "running full update");
        let snapshot = self
            .with_retry(|| self.source.fetch_all())
            .map_err(|c| UpdateError::new(kind, Stage::Fetching, c))?;
        let changes = snapshot.records.len();
        let previous_len = previous.as_ref().and_then(|wm| wm.record_count).unwrap_or(0);
        let map = MapData::from_records(kind, snapshot.records)
            .map_err(|e| UpdateError::new(kind, Stage::Merging, e))?;
        map.validate()
            .map_err(|e| UpdateError::new(kind, Stage::Merging, e))?;
        Ok(Plan {
            mode: Mode::Full,
            reason: Some(reason),
            map,
            changes,
            marker: snapshot.marker,
            previous,
            previous_len,
        })
    }

    fn full_reason(&self, options: UpdateOptions, previous: Option<&Watermark>) -> Option<FullReason> {
        if options.force_full {
            return Some(FullReason::Forced);
        }
        let Some(wm) = previous else {
            return Some(FullReason::NoWatermark);
        };
        if wm.source_marker.is_none() {
            return Some(FullReason::NoWatermark);
        }
        match wm.last_full_update {
            Some(last) if !elapsed(last, self.settings.full_update_interval) => None,
            _ => Some(FullReason::FullIntervalElapsed),
        }
    }

    /// Attempt an incremental plan. The inner `Err` carries the reason to
    /// fall back to a full update; the outer one is a hard failure.
    fn try_incremental(
        &self,
        previous: Option<&Watermark>,
    ) -> Result<Result<Plan, FullReason>, UpdateError> {
        let kind = self.kind();
        let Some(since) = previous.and_then(|wm| wm.source_marker) else {
            return Ok(Err(FullReason::NoWatermark));
        };
        let recorded = previous.and_then(|wm| wm.record_count).unwrap_or(0);

        let mut map = match self.cache.read_active() {
            Ok(active) => active.map,
            Err(e) => {
                tracing::warn!(map = %kind, "cannot read active generation: {e}");
                return Ok(Err(FullReason::ActiveUnreadable(e.to_string())));
            }
        };
        // An empty cache that was empty last time too is rebuilt from scratch;
        // one that lost its records goes through the guard instead.
        if map.is_empty() && recorded == 0 {
            return Ok(Err(FullReason::EmptyActive));
        }
        let previous_len = map.len().max(recorded);

        tracing::info!(map = %kind, %since, "running incremental update");
        let delta = match self.with_retry(|| self.source.fetch_since(since)) {
            Ok(delta) => delta,
            Err(Cause::Source(SourceError::WatermarkTooOld { .. })) => {
                tracing::info!(map = %kind, %since, "source cannot serve a delta");
                return Ok(Err(FullReason::WatermarkTooOld));
            }
            Err(cause) => return Err(UpdateError::new(kind, Stage::Fetching, cause)),
        };

        let changes = delta.changes.len();
        for change in delta.changes {
            map.apply(change)
                .map_err(|e| UpdateError::new(kind, Stage::Merging, e))?;
        }
        map.validate()
            .map_err(|e| UpdateError::new(kind, Stage::Merging, e))?;
        tracing::debug!(map = %kind, changes, previous = previous_len, records = map.len(), "merged delta");

        Ok(Ok(Plan {
            mode: Mode::Incremental,
            reason: None,
            map,
            changes,
            marker: delta.marker,
            previous: None,
            previous_len,
        }))
    }

    /// Refuse to publish an empty map unless forced.
    ///
    /// Incremental plans only reach this point with a non-empty previous
    /// generation, so an empty result always means records were lost.
    fn guard(&self, plan: &Plan, options: UpdateOptions) -> Result<(), UpdateError> {
        if !plan.map.is_empty() || options.force_write {
            return Ok(());
        }
        tracing::error!(
            map = %self.kind(),
            previous = plan.previous_len,
            mode = %plan.mode,
            "empty result guard tripped"
        );
        Err(UpdateError::new(
            self.kind(),
            Stage::Merging,
            Cause::EmptyResult {
                previous: plan.previous_len,
            },
        ))
    }

    fn next_watermark(&self, plan: &Plan, digest: String) -> Watermark {
        let now = Utc::now();
        let old = plan.previous.clone().unwrap_or_default();
        let source_marker = match (old.source_marker, plan.marker) {
            (Some(old_marker), Some(new_marker)) if new_marker < old_marker => {
                tracing::warn!(
                    map = %self.kind(),
                    %old_marker,
                    %new_marker,
                    "source marker went backwards; keeping the stored one"
                );
                Some(old_marker)
            }
            (old_marker, new_marker) => new_marker.or(old_marker),
        };
        Watermark {
            last_full_update: match plan.mode {
                Mode::Full => Some(now),
                Mode::Incremental => old.last_full_update,
            },
            last_incremental_update: match plan.mode {
                Mode::Full => old.last_incremental_update,
                Mode::Incremental => Some(now),
            },
            last_update: Some(now),
            source_marker,
            record_count: Some(plan.map.len()),
            digest: Some(digest),
        }
    }

    /// Call `op`, retrying transient source failures with backoff.
    fn with_retry<T>(&self, mut op: impl FnMut() -> Result<T, SourceError>) -> Result<T, Cause> {
        let kind = self.kind();
        let attempts = self.settings.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            if self.cancel.is_cancelled() {
                return Err(Cause::Cancelled);
            }
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.settings.retry.delay_for(attempt);
                    tracing::warn!(
                        map = %kind,
                        attempt,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        "{e}; retrying"
                    );
                    self.sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn sleep(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        while !self.cancel.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
        }
    }
}

fn elapsed(since: DateTime<Utc>, interval: Duration) -> bool {
    let age = Utc::now().signed_duration_since(since);
    age.to_std().map(|age| age >= interval).unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use chrono::TimeZone;
    use nsscache_cache::{CacheBackend, PublishOutcome};
    use nsscache_core::format::parse_line;
    use nsscache_core::{CacheConfig, Change, Record};
    use nsscache_source::{ChangeSet, Snapshot};
    use tempfile::TempDir;

    /// Scripted source: each call pops the next canned answer.
    struct FakeSource {
        kind: MapKind,
        full: RefCell<VecDeque<Result<Snapshot, SourceError>>>,
        delta: RefCell<VecDeque<Result<ChangeSet, SourceError>>>,
        calls: RefCell<Vec<&'static str>>,
    }

    impl FakeSource {
        fn new(kind: MapKind) -> Self {
            Self {
                kind,
                full: RefCell::default(),
                delta: RefCell::default(),
                calls: RefCell::default(),
            }
        }

        fn full(self, records: Vec<Record>, marker: i64) -> Self {
            self.full.borrow_mut().push_back(Ok(Snapshot {
                records,
                marker: Some(ts(marker)),
            }));
            self
        }

        fn full_err(self, err: SourceError) -> Self {
            self.full.borrow_mut().push_back(Err(err));
            self
        }

        fn delta(self, changes: Vec<Change>, marker: Option<i64>) -> Self {
            self.delta.borrow_mut().push_back(Ok(ChangeSet {
                changes,
                marker: marker.map(ts),
            }));
            self
        }

        fn delta_err(self, err: SourceError) -> Self {
            self.delta.borrow_mut().push_back(Err(err));
            self
        }
    }

    impl Source for FakeSource {
        fn kind(&self) -> MapKind {
            self.kind
        }

        fn fetch_all(&self) -> Result<Snapshot, SourceError> {
            self.calls.borrow_mut().push("fetch_all");
            self.full
                .borrow_mut()
                .pop_front()
                .expect("unexpected fetch_all")
        }

        fn fetch_since(&self, _since: DateTime<Utc>) -> Result<ChangeSet, SourceError> {
            self.calls.borrow_mut().push("fetch_since");
            self.delta
                .borrow_mut()
                .pop_front()
                .expect("unexpected fetch_since")
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn user(name: &str, uid: u32) -> Record {
        parse_line(
            MapKind::Passwd,
            &format!("{name}:x:{uid}:{uid}::/home/{name}:/bin/sh"),
        )
        .unwrap()
    }

    fn unavailable() -> SourceError {
        SourceError::Unavailable {
            map: MapKind::Passwd,
            message: "connection refused".into(),
        }
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            full_update_interval: Duration::from_secs(3600),
            retry: RetryPolicy {
                max_attempts: 3,
                delay_ms: 1,
            },
        }
    }

    fn engine(dir: &TempDir, source: FakeSource) -> UpdateEngine<FakeSource, CacheBackend> {
        let cache =
            CacheBackend::open(MapKind::Passwd, &CacheConfig::files(dir.path()), dir.path())
                .unwrap();
        UpdateEngine::new(source, cache, settings())
    }

    fn seeded(dir: &TempDir) {
        let e = engine(
            dir,
            FakeSource::new(MapKind::Passwd).full(vec![user("alice", 1000), user("bob", 1001)], 0),
        );
        e.run(UpdateOptions::default()).expect("seed");
    }

    #[test]
    fn first_run_is_full() {
        let dir = TempDir::new().unwrap();
        let e = engine(
            &dir,
            FakeSource::new(MapKind::Passwd).full(vec![user("alice", 1000)], 5),
        );
        let report = e.run(UpdateOptions::default()).unwrap();
        assert_eq!(report.mode, Mode::Full);
        assert_eq!(report.reason, Some(FullReason::NoWatermark));
        assert_eq!(report.outcome, PublishOutcome::Published);
        assert_eq!(report.marker, Some(ts(5)));
    }

    #[test]
    fn incremental_applies_upserts_and_deletes() {
        let dir = TempDir::new().unwrap();
        seeded(&dir);
        let e = engine(
            &dir,
            FakeSource::new(MapKind::Passwd).delta(
                vec![Change::Upsert(user("carol", 1002)), Change::Delete("bob".into())],
                Some(10),
            ),
        );
        let report = e.run(UpdateOptions::default()).unwrap();
        assert_eq!(report.mode, Mode::Incremental);
        assert_eq!(report.changes, 2);

        let active = e.cache().read_active().unwrap();
        let names: Vec<_> = active.map.names().collect();
        assert_eq!(names, vec!["alice", "carol"]);
        let wm = active.watermark.unwrap();
        assert_eq!(wm.source_marker, Some(ts(10)));
        assert!(wm.last_incremental_update.is_some());
    }

    #[test]
    fn watermark_too_old_falls_back_to_full() {
        let dir = TempDir::new().unwrap();
        seeded(&dir);
        let e = engine(
            &dir,
            FakeSource::new(MapKind::Passwd)
                .delta_err(SourceError::WatermarkTooOld {
                    map: MapKind::Passwd,
                    since: ts(0),
                })
                .full(vec![user("alice", 1000)], 20),
        );
        let report = e.run(UpdateOptions::default()).unwrap();
        assert_eq!(report.mode, Mode::Full);
        assert_eq!(report.reason, Some(FullReason::WatermarkTooOld));
        assert_eq!(*e.source().calls.borrow(), vec!["fetch_since", "fetch_all"]);
    }

    #[test]
    fn transient_errors_are_retried_then_fail() {
        let dir = TempDir::new().unwrap();
        let e = engine(
            &dir,
            FakeSource::new(MapKind::Passwd)
                .full_err(unavailable())
                .full(vec![user("alice", 1000)], 1),
        );
        assert!(e.run(UpdateOptions::default()).is_ok());

        let dir = TempDir::new().unwrap();
        let e = engine(
            &dir,
            FakeSource::new(MapKind::Passwd)
                .full_err(unavailable())
                .full_err(unavailable())
                .full_err(unavailable()),
        );
        let err = e.run(UpdateOptions::default()).unwrap_err();
        assert_eq!(err.stage, Stage::Fetching);
        assert_eq!(e.source().calls.borrow().len(), 3);
    }

    #[test]
    fn protocol_errors_are_not_retried() {
        let dir = TempDir::new().unwrap();
        let e = engine(
            &dir,
            FakeSource::new(MapKind::Passwd).full_err(SourceError::Protocol {
                map: MapKind::Passwd,
                message: "garbage".into(),
            }),
        );
        assert!(e.run(UpdateOptions::default()).is_err());
        assert_eq!(e.source().calls.borrow().len(), 1);
    }

    #[test]
    fn empty_full_fetch_is_refused_unless_forced() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir, FakeSource::new(MapKind::Passwd).full(vec![], 1));
        let err = e.run(UpdateOptions::default()).unwrap_err();
        assert_eq!(err.kind(), crate::FailureKind::EmptyResultGuard);

        let e = engine(&dir, FakeSource::new(MapKind::Passwd).full(vec![], 1));
        let forced = UpdateOptions {
            force_write: true,
            ..UpdateOptions::default()
        };
        assert_eq!(e.run(forced).unwrap().records, 0);
    }

    #[test]
    fn marker_never_regresses() {
        let dir = TempDir::new().unwrap();
        seeded(&dir);
        let e = engine(
            &dir,
            FakeSource::new(MapKind::Passwd)
                .delta(vec![Change::Upsert(user("dave", 1003))], Some(-100)),
        );
        let report = e.run(UpdateOptions::default()).unwrap();
        assert_eq!(report.marker, Some(ts(0)));
    }

    #[test]
    fn cancelled_before_fetch_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let e = engine(&dir, FakeSource::new(MapKind::Passwd)).with_cancel(cancel);
        let err = e.run(UpdateOptions::default()).unwrap_err();
        assert_eq!(err.kind(), crate::FailureKind::Cancelled);
        assert!(e.source().calls.borrow().is_empty());
        assert!(e.cache().read_watermark().unwrap().is_none());
    }

    #[test]
    fn elapsed_full_interval_forces_full() {
        let dir = TempDir::new().unwrap();
        seeded(&dir);
        let cache = CacheBackend::open(MapKind::Passwd, &CacheConfig::files(dir.path()), dir.path())
            .unwrap();
        let mut wm = cache.read_watermark().unwrap().unwrap();
        wm.last_full_update = Some(Utc::now() - chrono::Duration::hours(2));
        cache.commit_watermark(&wm).unwrap();

        let e = engine(
            &dir,
            FakeSource::new(MapKind::Passwd).full(vec![user("alice", 1000), user("bob", 1001)], 0),
        );
        let report = e.run(UpdateOptions::default()).unwrap();
        assert_eq!(report.reason, Some(FullReason::FullIntervalElapsed));
        assert_eq!(report.outcome, PublishOutcome::Unchanged);
    }

    #[test]
    fn staging_failure_is_not_a_publish_failure() {
        let dir = TempDir::new().unwrap();
        // The cache directory sits below a regular file, so it can never be created.
        std::fs::write(dir.path().join("blocker"), "").unwrap();
        let cache = CacheBackend::open(
            MapKind::Passwd,
            &CacheConfig::files(dir.path().join("blocker/cache")),
            dir.path(),
        )
        .unwrap();
        let source = FakeSource::new(MapKind::Passwd).full(vec![user("alice", 1000)], 0);
        let e = UpdateEngine::new(source, cache, settings());

        let err = e.run(UpdateOptions::default()).unwrap_err();
        assert_eq!(err.stage, Stage::Merging);
        assert_eq!(err.kind(), crate::FailureKind::WriteError);
        assert!(e.cache().read_watermark().unwrap().is_none());
    }
}
