//! Watermark store: per-map update bookkeeping persisted next to the cache.
//!
//! Persists a [`Watermark`] JSON document at
//! `<timestamp_dir>/timestamp-<map>.json`. Writes use the same `.tmp` +
//! fsync + rename pattern as the cache files.
//!
//! Older installations kept two one-line text files instead:
//! `timestamp-<map>-modify` (source marker) and `timestamp-<map>-update`
//! (last full update), both `YYYY-MM-DDThh:mm:ssZ`. They are read when no
//! JSON store exists and are superseded by the first save.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use nsscache_core::MapKind;

use crate::error::{io_err, CacheError};

const LEGACY_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Bookkeeping for a map's active generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Watermark {
    pub last_full_update: Option<DateTime<Utc>>,
    pub last_incremental_update: Option<DateTime<Utc>>,
    /// Most recent successful update of either mode.
    pub last_update: Option<DateTime<Utc>>,
    /// Lower bound for the next incremental fetch.
    pub source_marker: Option<DateTime<Utc>>,
    pub record_count: Option<usize>,
    /// SHA-256 of the published primary file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// `<dir>/timestamp-<map>.json`
pub fn store_path(dir: &Path, kind: MapKind) -> PathBuf {
    dir.join(format!("timestamp-{kind}.json"))
}

fn legacy_path(dir: &Path, kind: MapKind, which: &str) -> PathBuf {
    dir.join(format!("timestamp-{kind}-{which}"))
}

/// Load the watermark for `kind`. Returns `None` when no store exists.
pub fn load(dir: &Path, kind: MapKind) -> Result<Option<Watermark>, CacheError> {
    let path = store_path(dir, kind);
    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            let wm = serde_json::from_str(&contents)
                .map_err(|e| CacheError::Json { path, source: e })?;
            Ok(Some(wm))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => load_legacy(dir, kind),
        Err(e) => Err(io_err(path, e)),
    }
}

fn load_legacy(dir: &Path, kind: MapKind) -> Result<Option<Watermark>, CacheError> {
    let modify = read_legacy(&legacy_path(dir, kind, "modify"))?;
    let update = read_legacy(&legacy_path(dir, kind, "update"))?;
    if modify.is_none() && update.is_none() {
        return Ok(None);
    }
    tracing::debug!(map = %kind, "read legacy timestamp files in {}", dir.display());
    Ok(Some(Watermark {
        last_full_update: update,
        last_update: update,
        source_marker: modify,
        ..Watermark::default()
    }))
}

fn read_legacy(path: &Path) -> Result<Option<DateTime<Utc>>, CacheError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path, e)),
    };
    match NaiveDateTime::parse_from_str(contents.trim(), LEGACY_FORMAT) {
        Ok(ts) => Ok(Some(ts.and_utc())),
        Err(e) => {
            tracing::warn!("ignoring unparseable timestamp in {}: {e}", path.display());
            Ok(None)
        }
    }
}

/// Save the watermark for `kind` durably.
pub fn save(dir: &Path, kind: MapKind, watermark: &Watermark) -> Result<(), CacheError> {
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    let path = store_path(dir, kind);
    let json = serde_json::to_string_pretty(watermark).map_err(|e| CacheError::Json {
        path: path.clone(),
        source: e,
    })?;

    let tmp = path.with_extension("json.tmp");
    let write = || -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()
    };
    if let Err(e) = write() {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(&tmp, e));
    }
    if let Err(e) = std::fs::rename(&tmp, &path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(&path, e));
    }

    for which in ["modify", "update"] {
        let legacy = legacy_path(dir, kind, which);
        if legacy.exists() {
            let _ = std::fs::remove_file(&legacy);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn missing_store_is_none() {
        let tmp = TempDir::new().unwrap();
        assert!(load(tmp.path(), MapKind::Passwd).unwrap().is_none());
    }

    #[test]
    fn roundtrip_save_load() {
        let tmp = TempDir::new().unwrap();
        let wm = Watermark {
            last_full_update: Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()),
            source_marker: Some(Utc.with_ymd_and_hms(2024, 5, 1, 9, 59, 0).unwrap()),
            record_count: Some(2),
            digest: Some("deadbeef".into()),
            ..Watermark::default()
        };
        save(tmp.path(), MapKind::Group, &wm).unwrap();
        assert_eq!(load(tmp.path(), MapKind::Group).unwrap(), Some(wm));
        assert!(!store_path(tmp.path(), MapKind::Group)
            .with_extension("json.tmp")
            .exists());
    }

    #[test]
    fn legacy_text_files_are_read_then_superseded() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("timestamp-passwd-modify"), "2024-05-01T09:00:00Z\n")
            .unwrap();
        std::fs::write(tmp.path().join("timestamp-passwd-update"), "2024-05-01T10:00:00Z\n")
            .unwrap();

        let wm = load(tmp.path(), MapKind::Passwd).unwrap().expect("legacy");
        assert_eq!(
            wm.source_marker,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap())
        );
        assert_eq!(
            wm.last_full_update,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap())
        );

        save(tmp.path(), MapKind::Passwd, &wm).unwrap();
        assert!(!tmp.path().join("timestamp-passwd-modify").exists());
        assert_eq!(load(tmp.path(), MapKind::Passwd).unwrap(), Some(wm));
    }

    #[test]
    fn store_with_missing_fields_loads() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            store_path(tmp.path(), MapKind::Shadow),
            r#"{"source_marker":"2024-05-01T09:00:00Z"}"#,
        )
        .unwrap();
        let wm = load(tmp.path(), MapKind::Shadow).unwrap().unwrap();
        assert!(wm.last_full_update.is_none());
        assert!(wm.source_marker.is_some());
    }
}
