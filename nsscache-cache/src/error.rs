//! Error types for nsscache-cache.

use std::path::PathBuf;

use thiserror::Error;

use nsscache_core::MapKind;

/// All errors that can arise from reading, staging or publishing a cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// No active generation exists yet for this map.
    #[error("no {map} cache at {path}")]
    NotFound { map: MapKind, path: PathBuf },

    /// The active generation exists but cannot be parsed.
    #[error("{map} cache at {path} is corrupt: {message}")]
    Corrupt {
        map: MapKind,
        path: PathBuf,
        message: String,
    },

    /// A staged file did not read back as written.
    #[error("staged file {path} failed readback: {message}")]
    Readback { path: PathBuf, message: String },

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error (watermark store).
    #[error("watermark store JSON error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown cache backend '{0}'; expected: files")]
    UnknownBackend(String),
}

/// Convenience constructor for [`CacheError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> CacheError {
    CacheError::Io {
        path: path.into(),
        source,
    }
}
