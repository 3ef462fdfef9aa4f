//! Resolved runtime configuration and its YAML loader.
//!
//! # File layout
//!
//! ```yaml
//! lock_dir: /var/run/nsscache
//! timestamp_dir: /var/lib/nsscache      # optional, defaults to the cache dir
//! full_update_interval: 86400           # seconds
//! incremental_update_interval: 900      # seconds
//! lock_timeout: 10                      # seconds
//! retry: { max_attempts: 3, delay_ms: 500 }
//! source: { backend: http, base_url: "https://dir.example.com/nss" }
//! cache:  { backend: files, dir: /etc, suffix: cache }
//! maps:
//!   passwd: {}
//!   group: {}
//!   shadow: { source: { backend: files, dir: /srv/export } }
//! ```
//!
//! Per-map `source`/`cache` blocks replace the top-level defaults wholesale.
//! The loaded [`Config`] is immutable; callers share it by reference.

use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::MapKind;

/// Fallback config path when neither `--config` nor `NSSCACHE_CONFIG` is set.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/nsscache.yaml";

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "NSSCACHE_CONFIG";

// ---------------------------------------------------------------------------
// Back-end blocks
// ---------------------------------------------------------------------------

/// Connection parameters for a map's source. `backend` selects the variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub backend: String,
    /// `files`: directory holding the exported snapshot and journal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// `http`: base URL; the map name is appended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// `http`: full URL overriding `base_url`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl SourceConfig {
    /// A `files` source rooted at `dir`.
    pub fn files(dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: "files".to_string(),
            dir: Some(dir.into()),
            base_url: None,
            url: None,
            timeout_secs: default_timeout_secs(),
        }
    }

    /// An `http` source below `base_url`.
    pub fn http(base_url: impl Into<String>) -> Self {
        Self {
            backend: "http".to_string(),
            dir: None,
            base_url: Some(base_url.into()),
            url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Where and how a map's cache files are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default = "default_cache_backend")]
    pub backend: String,
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_cache_suffix")]
    pub suffix: String,
}

impl CacheConfig {
    /// A `files` cache writing `<dir>/<map>.cache`.
    pub fn files(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            dir: default_cache_dir(),
            suffix: default_cache_suffix(),
        }
    }
}

/// Bounded retry of transient source failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further retry.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.delay_ms.saturating_mul(factor))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Fully resolved settings for one configured map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapOptions {
    pub kind: MapKind,
    pub source: SourceConfig,
    pub cache: CacheConfig,
}

/// The configuration object consumed by the update engine and commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub lock_dir: PathBuf,
    pub timestamp_dir: Option<PathBuf>,
    pub full_update_interval: Duration,
    pub incremental_update_interval: Duration,
    pub lock_timeout: Duration,
    pub retry: RetryPolicy,
    /// Configured maps, in file order.
    pub maps: Vec<MapOptions>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock_dir: default_lock_dir(),
            timestamp_dir: None,
            full_update_interval: Duration::from_secs(default_full_interval()),
            incremental_update_interval: Duration::from_secs(default_incremental_interval()),
            lock_timeout: Duration::from_secs(default_lock_timeout()),
            retry: RetryPolicy::default(),
            maps: Vec::new(),
        }
    }
}

impl Config {
    /// Path to load when no explicit `--config` was given.
    pub fn default_path() -> PathBuf {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load and validate the YAML config at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_yaml_str(&contents, path)
    }

    /// Parse YAML text. `path` is only used to annotate errors.
    pub fn from_yaml_str(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        raw.resolve()
    }

    pub fn map(&self, kind: MapKind) -> Option<&MapOptions> {
        self.maps.iter().find(|m| m.kind == kind)
    }

    pub fn map_kinds(&self) -> Vec<MapKind> {
        self.maps.iter().map(|m| m.kind).collect()
    }

    /// Resolve a `--map` selection. An empty request means every configured map.
    pub fn select(&self, requested: &[MapKind]) -> Result<Vec<MapKind>, ConfigError> {
        if requested.is_empty() {
            return Ok(self.map_kinds());
        }
        let mut selected = Vec::new();
        for kind in requested {
            if self.map(*kind).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "map '{kind}' is not configured"
                )));
            }
            if !selected.contains(kind) {
                selected.push(*kind);
            }
        }
        Ok(selected)
    }

    /// Directory holding the watermark store for `map`.
    pub fn timestamp_dir_for(&self, map: &MapOptions) -> PathBuf {
        self.timestamp_dir
            .clone()
            .unwrap_or_else(|| map.cache.dir.clone())
    }
}

// ---------------------------------------------------------------------------
// On-disk shape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default = "default_lock_dir")]
    lock_dir: PathBuf,
    #[serde(default)]
    timestamp_dir: Option<PathBuf>,
    #[serde(default = "default_full_interval")]
    full_update_interval: u64,
    #[serde(default = "default_incremental_interval")]
    incremental_update_interval: u64,
    #[serde(default = "default_lock_timeout")]
    lock_timeout: u64,
    #[serde(default)]
    retry: RetryPolicy,
    #[serde(default)]
    source: Option<SourceConfig>,
    #[serde(default)]
    cache: Option<CacheConfig>,
    #[serde(default)]
    maps: IndexMap<String, Option<RawMapOptions>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMapOptions {
    #[serde(default)]
    source: Option<SourceConfig>,
    #[serde(default)]
    cache: Option<CacheConfig>,
}

impl RawConfig {
    fn resolve(self) -> Result<Config, ConfigError> {
        if self.maps.is_empty() {
            return Err(ConfigError::Invalid("no maps configured".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        let mut maps: Vec<MapOptions> = Vec::new();
        for (name, options) in self.maps {
            let kind: MapKind = name.parse()?;
            if maps.iter().any(|m| m.kind == kind) {
                return Err(ConfigError::Invalid(format!("map '{kind}' listed twice")));
            }
            let options = options.unwrap_or_default();
            let source = options
                .source
                .or_else(|| self.source.clone())
                .ok_or_else(|| ConfigError::Invalid(format!("map '{kind}' has no source")))?;
            let cache = options
                .cache
                .or_else(|| self.cache.clone())
                .unwrap_or_default();
            maps.push(MapOptions {
                kind,
                source,
                cache,
            });
        }

        Ok(Config {
            lock_dir: self.lock_dir,
            timestamp_dir: self.timestamp_dir,
            full_update_interval: Duration::from_secs(self.full_update_interval),
            incremental_update_interval: Duration::from_secs(self.incremental_update_interval),
            lock_timeout: Duration::from_secs(self.lock_timeout),
            retry: self.retry,
            maps,
        })
    }
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from("/var/run/nsscache")
}
fn default_full_interval() -> u64 {
    24 * 60 * 60
}
fn default_incremental_interval() -> u64 {
    15 * 60
}
fn default_lock_timeout() -> u64 {
    10
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_attempts() -> u32 {
    3
}
fn default_delay_ms() -> u64 {
    500
}
fn default_cache_backend() -> String {
    "files".to_string()
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from("/etc")
}
fn default_cache_suffix() -> String {
    "cache".to_string()
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<Config, ConfigError> {
        Config::from_yaml_str(yaml, Path::new("/etc/nsscache.yaml"))
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = parse(
            "source: { backend: files, dir: /srv/export }\nmaps:\n  passwd:\n  group: {}\n",
        )
        .expect("parse");
        assert_eq!(cfg.map_kinds(), vec![MapKind::Passwd, MapKind::Group]);
        assert_eq!(cfg.lock_timeout, Duration::from_secs(10));
        assert_eq!(cfg.full_update_interval, Duration::from_secs(86_400));
        let passwd = cfg.map(MapKind::Passwd).unwrap();
        assert_eq!(passwd.cache, CacheConfig::default());
        assert_eq!(passwd.source, SourceConfig::files("/srv/export"));
    }

    #[test]
    fn per_map_override_replaces_default() {
        let cfg = parse(
            r#"
source: { backend: http, base_url: "https://dir.example.com/nss" }
cache: { dir: /var/cache/nss }
maps:
  passwd: {}
  shadow:
    source: { backend: files, dir: /srv/secure }
    cache: { dir: /etc, suffix: "" }
"#,
        )
        .expect("parse");
        let shadow = cfg.map(MapKind::Shadow).unwrap();
        assert_eq!(shadow.source.backend, "files");
        assert_eq!(shadow.cache.suffix, "");
        let passwd = cfg.map(MapKind::Passwd).unwrap();
        assert_eq!(passwd.source.backend, "http");
        assert_eq!(passwd.cache.dir, PathBuf::from("/var/cache/nss"));
        assert_eq!(cfg.timestamp_dir_for(passwd), PathBuf::from("/var/cache/nss"));
    }

    #[test]
    fn map_without_source_is_invalid() {
        let err = parse("maps:\n  passwd: {}\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("no source")), "got: {err}");
    }

    #[test]
    fn unknown_map_is_rejected() {
        let err = parse("source: { backend: files, dir: /x }\nmaps:\n  automount: {}\n")
            .unwrap_err();
        assert!(err.to_string().contains("automount"));
    }

    #[test]
    fn unknown_key_is_a_parse_error_with_path() {
        let err = parse("source: { backend: files }\nmap:\n  passwd: {}\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("/etc/nsscache.yaml"));
    }

    #[test]
    fn select_defaults_to_all_and_rejects_unconfigured() {
        let cfg = parse("source: { backend: files, dir: /x }\nmaps:\n  group: {}\n").unwrap();
        assert_eq!(cfg.select(&[]).unwrap(), vec![MapKind::Group]);
        assert!(cfg.select(&[MapKind::Shadow]).is_err());
        assert_eq!(
            cfg.select(&[MapKind::Group, MapKind::Group]).unwrap(),
            vec![MapKind::Group]
        );
    }

    #[test]
    fn retry_backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 4,
            delay_ms: 100,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }
}
