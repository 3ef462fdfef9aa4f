//! Error types for nsscache-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::MapKind;

/// Errors raised while building or mutating in-memory maps.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A map name that is not one of the supported kinds.
    #[error("unsupported map '{0}'; expected: passwd, group, shadow, netgroup")]
    UnknownMap(String),

    /// A record of one kind was applied to a map of another.
    #[error("cannot apply a {record} record to a {map} map")]
    KindMismatch { map: MapKind, record: MapKind },

    /// Two records share a secondary numeric key (uid/gid).
    #[error("{map} map has duplicate id {id} ('{first}' and '{second}')")]
    DuplicateId {
        map: MapKind,
        id: u32,
        first: String,
        second: String,
    },
}

/// A line that does not match the colon-delimited syntax of its map.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("{map} line has {found} fields, expected {expected}")]
    FieldCount {
        map: MapKind,
        expected: usize,
        found: usize,
    },

    #[error("{map} field '{field}' is not a valid number: '{value}'")]
    Number {
        map: MapKind,
        field: &'static str,
        value: String,
    },

    #[error("{map} line has an empty name")]
    EmptyName { map: MapKind },
}

/// Errors from loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure reading the file.
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error, with the file path and serde_yaml's line context.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The file parsed but describes an unusable setup.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Map(#[from] CoreError),
}
