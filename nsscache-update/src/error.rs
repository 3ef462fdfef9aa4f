//! Error types for nsscache-update.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use nsscache_cache::CacheError;
use nsscache_core::{ConfigError, CoreError, MapKind};
use nsscache_source::SourceError;

/// Where in the update state machine a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Locked,
    Fetching,
    Merging,
    Publishing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Locked => "locking",
            Stage::Fetching => "fetching",
            Stage::Merging => "merging",
            Stage::Publishing => "publishing",
        })
    }
}

/// Coarse failure classes reported to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SourceUnavailable,
    SourceProtocolError,
    WatermarkTooOld,
    EmptyResultGuard,
    InvalidMap,
    WriteError,
    LockBusy,
    Config,
    Cancelled,
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::SourceUnavailable => "source unavailable",
            FailureKind::SourceProtocolError => "source protocol error",
            FailureKind::WatermarkTooOld => "watermark too old",
            FailureKind::EmptyResultGuard => "empty result guard",
            FailureKind::InvalidMap => "invalid map",
            FailureKind::WriteError => "write error",
            FailureKind::LockBusy => "lock busy",
            FailureKind::Config => "configuration error",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Internal => "internal error",
        })
    }
}

/// Errors from the per-map lock.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("{map} update already in progress ({holder})")]
    Busy { map: MapKind, holder: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The underlying reason an update failed.
#[derive(Debug, Error)]
pub enum Cause {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Map(#[from] CoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(
        "refusing to publish an empty map (previous generation had {previous} records); \
         use --force-write to override"
    )]
    EmptyResult { previous: usize },

    #[error("cancelled")]
    Cancelled,

    #[error("update worker failed: {0}")]
    Worker(String),
}

/// A failed update of one map.
#[derive(Debug, Error)]
#[error("{map}: failed while {stage}: {cause}")]
pub struct UpdateError {
    pub map: MapKind,
    pub stage: Stage,
    #[source]
    pub cause: Cause,
}

impl UpdateError {
    pub fn new(map: MapKind, stage: Stage, cause: impl Into<Cause>) -> Self {
        Self {
            map,
            stage,
            cause: cause.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match &self.cause {
            Cause::Source(SourceError::Unavailable { .. }) => FailureKind::SourceUnavailable,
            Cause::Source(SourceError::Protocol { .. }) => FailureKind::SourceProtocolError,
            Cause::Source(SourceError::WatermarkTooOld { .. }) => FailureKind::WatermarkTooOld,
            Cause::Source(SourceError::UnknownBackend(_))
            | Cause::Source(SourceError::Misconfigured { .. })
            | Cause::Cache(CacheError::UnknownBackend(_)) => FailureKind::Config,
            Cause::Cache(_) => FailureKind::WriteError,
            Cause::Lock(LockError::Busy { .. }) => FailureKind::LockBusy,
            Cause::Lock(LockError::Io { .. }) => FailureKind::WriteError,
            Cause::Map(_) => FailureKind::InvalidMap,
            Cause::Config(_) => FailureKind::Config,
            Cause::EmptyResult { .. } => FailureKind::EmptyResultGuard,
            Cause::Cancelled => FailureKind::Cancelled,
            Cause::Worker(_) => FailureKind::Internal,
        }
    }

    pub fn is_lock_busy(&self) -> bool {
        self.kind() == FailureKind::LockBusy
    }
}

/// Errors from the read-only commands (status, verify, diff).
#[derive(Debug, Error)]
pub enum CheckError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Map(#[from] CoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_follows_cause() {
        let err = UpdateError::new(
            MapKind::Passwd,
            Stage::Fetching,
            SourceError::Protocol {
                map: MapKind::Passwd,
                message: "bad".into(),
            },
        );
        assert_eq!(err.kind(), FailureKind::SourceProtocolError);
        assert_eq!(
            err.to_string(),
            "passwd: failed while fetching: passwd source returned a malformed response: bad"
        );

        let busy = UpdateError::new(
            MapKind::Group,
            Stage::Locked,
            LockError::Busy {
                map: MapKind::Group,
                holder: "pid 42".into(),
            },
        );
        assert!(busy.is_lock_busy());
    }
}
