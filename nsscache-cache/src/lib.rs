//! # nsscache-cache
//!
//! Local storage for map generations.
//!
//! A generation is written in two phases: [`Cache::write_generation`] stages
//! every file under a temporary name and checks it, then [`Cache::publish`]
//! renames the staged files over the active ones. The watermark store
//! ([`watermark`]) is only committed by the caller after publish succeeds.

use std::path::PathBuf;

use serde::Serialize;

use nsscache_core::{CacheConfig, MapData, MapKind};

pub mod error;
pub mod files;
pub mod index;
pub mod watermark;

pub use error::CacheError;
pub use files::{FilesCache, StagedGeneration};
pub use watermark::Watermark;

/// The active generation as read back from storage.
#[derive(Debug, Clone)]
pub struct ActiveGeneration {
    pub map: MapData,
    /// `None` when the files exist but no watermark was ever committed.
    pub watermark: Option<Watermark>,
}

/// What [`Cache::publish`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishOutcome {
    Published,
    /// The active generation was already byte-identical.
    Unchanged,
}

/// Storage contract used by the update engine.
pub trait Cache {
    fn kind(&self) -> MapKind;

    /// The active map and its watermark, or [`CacheError::NotFound`].
    fn read_active(&self) -> Result<ActiveGeneration, CacheError>;

    fn read_watermark(&self) -> Result<Option<Watermark>, CacheError>;

    /// Stage `map` without affecting the active generation.
    fn write_generation(&self, map: &MapData) -> Result<StagedGeneration, CacheError>;

    /// Atomically replace the active generation with `generation`.
    fn publish(&self, generation: StagedGeneration) -> Result<PublishOutcome, CacheError>;

    fn commit_watermark(&self, watermark: &Watermark) -> Result<(), CacheError>;

    /// Index consistency problems of the active generation.
    fn verify_indexes(&self) -> Result<Vec<String>, CacheError>;

    /// Hex SHA-256 of the active primary file.
    fn active_digest(&self) -> Result<Option<String>, CacheError>;

    fn primary_path(&self) -> PathBuf;

    /// Raw bytes of the active primary file.
    fn read_primary(&self) -> Result<Vec<u8>, CacheError>;

    /// The primary file a generation of `map` would contain.
    fn render(&self, map: &MapData) -> String;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The closed set of supported cache back ends.
#[derive(Debug, Clone)]
pub enum CacheBackend {
    Files(FilesCache),
}

impl CacheBackend {
    /// Resolve the back end named by `config.backend` for `kind`.
    pub fn open(
        kind: MapKind,
        config: &CacheConfig,
        timestamp_dir: impl Into<PathBuf>,
    ) -> Result<Self, CacheError> {
        match config.backend.as_str() {
            "files" => Ok(CacheBackend::Files(FilesCache::new(kind, config, timestamp_dir))),
            other => Err(CacheError::UnknownBackend(other.to_string())),
        }
    }
}

impl Cache for CacheBackend {
    fn kind(&self) -> MapKind {
        match self {
            CacheBackend::Files(c) => c.kind(),
        }
    }

    fn read_active(&self) -> Result<ActiveGeneration, CacheError> {
        match self {
            CacheBackend::Files(c) => c.read_active(),
        }
    }

    fn read_watermark(&self) -> Result<Option<Watermark>, CacheError> {
        match self {
            CacheBackend::Files(c) => c.read_watermark(),
        }
    }

    fn write_generation(&self, map: &MapData) -> Result<StagedGeneration, CacheError> {
        match self {
            CacheBackend::Files(c) => c.write_generation(map),
        }
    }

    fn publish(&self, generation: StagedGeneration) -> Result<PublishOutcome, CacheError> {
        match self {
            CacheBackend::Files(c) => c.publish(generation),
        }
    }

    fn commit_watermark(&self, watermark: &Watermark) -> Result<(), CacheError> {
        match self {
            CacheBackend::Files(c) => c.commit_watermark(watermark),
        }
    }

    fn verify_indexes(&self) -> Result<Vec<String>, CacheError> {
        match self {
            CacheBackend::Files(c) => c.verify_indexes(),
        }
    }

    fn active_digest(&self) -> Result<Option<String>, CacheError> {
        match self {
            CacheBackend::Files(c) => c.active_digest(),
        }
    }

    fn primary_path(&self) -> PathBuf {
        match self {
            CacheBackend::Files(c) => c.primary_path(),
        }
    }

    fn read_primary(&self) -> Result<Vec<u8>, CacheError> {
        match self {
            CacheBackend::Files(c) => c.read_primary(),
        }
    }

    fn render(&self, map: &MapData) -> String {
        match self {
            CacheBackend::Files(_) => files::render(map).primary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_backend_is_rejected() {
        let cfg = CacheConfig {
            backend: "nssdb".to_string(),
            ..CacheConfig::default()
        };
        let err = CacheBackend::open(MapKind::Passwd, &cfg, "/tmp").unwrap_err();
        assert!(matches!(err, CacheError::UnknownBackend(ref b) if b == "nssdb"));
    }
}
