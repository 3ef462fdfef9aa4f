//! nsscache core library: map kinds, typed records, line formats, config.
//!
//! Public API surface:
//! - [`types`]: [`MapKind`], per-kind entries, [`Record`], [`MapData`], [`Change`]
//! - [`format`]: colon-delimited line codecs matching the system databases
//! - [`config`]: the resolved configuration object and its YAML loader
//! - [`error`]: [`CoreError`], [`FormatError`], [`ConfigError`]

pub mod config;
pub mod error;
pub mod format;
pub mod types;

pub use config::{CacheConfig, Config, MapOptions, RetryPolicy, SourceConfig};
pub use error::{ConfigError, CoreError, FormatError};
pub use types::{
    Change, GroupEntry, MapData, MapKind, NetgroupEntry, PasswdEntry, Record, ShadowEntry,
};
