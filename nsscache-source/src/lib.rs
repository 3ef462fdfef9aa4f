//! # nsscache-source
//!
//! The narrow contract through which the update engine reads the remote
//! directory, and the back ends that implement it.
//!
//! - [`Source`]: `fetch_all` (full enumeration) and `fetch_since` (delta)
//! - [`FilesSource`]: an exported snapshot plus an optional change journal
//! - [`HttpSource`]: a map file served over HTTP with conditional GETs
//! - [`SourceBackend`]: the registry, resolved once from a [`SourceConfig`]

use chrono::{DateTime, Utc};

use nsscache_core::{Change, MapKind, Record, SourceConfig};

pub mod error;
pub mod files;
pub mod http;

pub use error::SourceError;
pub use files::FilesSource;
pub use http::HttpSource;

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Result of a full enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub records: Vec<Record>,
    /// The directory's modification marker, when it exposes one.
    pub marker: Option<DateTime<Utc>>,
}

/// Result of an incremental fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub changes: Vec<Change>,
    /// Marker to use as the lower bound of the next delta. `None` when the
    /// source saw nothing newer.
    pub marker: Option<DateTime<Utc>>,
}

impl ChangeSet {
    pub fn empty() -> Self {
        Self {
            changes: Vec::new(),
            marker: None,
        }
    }
}

/// Read-only access to one map of the remote directory.
///
/// Implementations keep no local state between calls and may return
/// records in any stable order.
pub trait Source {
    fn kind(&self) -> MapKind;

    /// Every current record plus the directory's modification marker.
    fn fetch_all(&self) -> Result<Snapshot, SourceError>;

    /// Changes strictly after `since`. Reports
    /// [`SourceError::WatermarkTooOld`] when the delta cannot be computed.
    fn fetch_since(&self, since: DateTime<Utc>) -> Result<ChangeSet, SourceError>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The closed set of supported source back ends.
#[derive(Debug)]
pub enum SourceBackend {
    Files(FilesSource),
    Http(HttpSource),
}

impl SourceBackend {
    /// Resolve the back end named by `config.backend` for `kind`.
    pub fn open(kind: MapKind, config: &SourceConfig) -> Result<Self, SourceError> {
        match config.backend.as_str() {
            "files" => {
                let dir = config.dir.clone().ok_or_else(|| SourceError::Misconfigured {
                    map: kind,
                    message: "files source requires 'dir'".to_string(),
                })?;
                Ok(SourceBackend::Files(FilesSource::new(kind, dir)))
            }
            "http" => {
                let url = match (&config.url, &config.base_url) {
                    (Some(url), _) => url.clone(),
                    (None, Some(base)) => format!("{}/{}", base.trim_end_matches('/'), kind),
                    (None, None) => {
                        return Err(SourceError::Misconfigured {
                            map: kind,
                            message: "http source requires 'base_url' or 'url'".to_string(),
                        })
                    }
                };
                Ok(SourceBackend::Http(HttpSource::new(
                    kind,
                    url,
                    std::time::Duration::from_secs(config.timeout_secs),
                )))
            }
            other => Err(SourceError::UnknownBackend(other.to_string())),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            SourceBackend::Files(_) => "files",
            SourceBackend::Http(_) => "http",
        }
    }
}

impl Source for SourceBackend {
    fn kind(&self) -> MapKind {
        match self {
            SourceBackend::Files(s) => s.kind(),
            SourceBackend::Http(s) => s.kind(),
        }
    }

    fn fetch_all(&self) -> Result<Snapshot, SourceError> {
        match self {
            SourceBackend::Files(s) => s.fetch_all(),
            SourceBackend::Http(s) => s.fetch_all(),
        }
    }

    fn fetch_since(&self, since: DateTime<Utc>) -> Result<ChangeSet, SourceError> {
        match self {
            SourceBackend::Files(s) => s.fetch_since(since),
            SourceBackend::Http(s) => s.fetch_since(since),
        }
    }
}
