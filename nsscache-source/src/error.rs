//! Error types for nsscache-source.

use chrono::{DateTime, Utc};
use thiserror::Error;

use nsscache_core::MapKind;

/// Failures a source can report. The update engine keys its retry and
/// fallback decisions off the variant.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Connection, authentication or transient server failure. Retried.
    #[error("{map} source unavailable: {message}")]
    Unavailable { map: MapKind, message: String },

    /// The directory answered with something that cannot be parsed.
    #[error("{map} source returned a malformed response: {message}")]
    Protocol { map: MapKind, message: String },

    /// The source can no longer compute a delta from `since`.
    #[error("{map} source cannot compute changes since {since}")]
    WatermarkTooOld { map: MapKind, since: DateTime<Utc> },

    #[error("unknown source backend '{0}'; expected: files, http")]
    UnknownBackend(String),

    #[error("{map} source misconfigured: {message}")]
    Misconfigured { map: MapKind, message: String },
}

impl SourceError {
    /// Whether the engine may retry the same call.
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Unavailable { .. })
    }
}

pub(crate) fn unavailable(map: MapKind, message: impl Into<String>) -> SourceError {
    SourceError::Unavailable {
        map,
        message: message.into(),
    }
}

pub(crate) fn protocol(map: MapKind, message: impl Into<String>) -> SourceError {
    SourceError::Protocol {
        map,
        message: message.into(),
    }
}
