//! # nsscache-update
//!
//! Update orchestration: per-map locking, the full/incremental engine, and
//! the read-only `status`, `verify` and `diff` checks.
//!
//! Call [`update_maps`] to update several maps in parallel, or
//! [`update_map`] to update a single one on the current thread.

pub mod engine;
pub mod error;
pub mod lock;
pub mod pipeline;
pub mod status;
pub mod verify;

pub use engine::{
    CancelToken, EngineSettings, FullReason, Mode, UpdateEngine, UpdateOptions, UpdateReport,
};
pub use error::{Cause, CheckError, FailureKind, LockError, Stage, UpdateError};
pub use lock::MapLock;
pub use pipeline::{update_map, update_maps, ExitStatus, MapResult, RunSummary};
pub use status::{Freshness, Intervals, MapCheck, MapStatus};
pub use verify::{VerifyReport, DEFAULT_SAMPLE};

use std::sync::Arc;

use nsscache_core::{Config, MapKind};

/// Force a full rebuild of `maps`, ignoring watermarks.
pub fn repair_maps(
    config: Arc<Config>,
    maps: &[MapKind],
    force_write: bool,
    cancel: CancelToken,
) -> std::io::Result<RunSummary> {
    let options = UpdateOptions {
        force_full: true,
        force_write,
    };
    update_maps(config, maps, options, cancel)
}
