//! `files` source: a directory export on local or mounted storage.
//!
//! ```text
//! <dir>/<map>           full snapshot, one record per line
//! <dir>/<map>.journal   JSON lines, appended by the exporter
//! ```
//!
//! Journal entries:
//!
//! ```text
//! {"op":"upsert","at":"2024-05-01T10:00:00Z","entry":"carol:x:1002:1002::/home/carol:/bin/sh"}
//! {"op":"delete","at":"2024-05-01T10:00:05Z","name":"bob"}
//! {"op":"compacted","at":"2024-05-01T00:00:00Z"}
//! ```
//!
//! A `compacted` entry means history up to `at` was discarded.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;

use nsscache_core::format::{parse_line, parse_map};
use nsscache_core::{Change, MapKind};

use crate::error::{protocol, unavailable, SourceError};
use crate::{ChangeSet, Snapshot, Source};

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum JournalOp {
    Upsert { at: DateTime<Utc>, entry: String },
    Delete { at: DateTime<Utc>, name: String },
    Compacted { at: DateTime<Utc> },
}

impl JournalOp {
    fn at(&self) -> DateTime<Utc> {
        match self {
            JournalOp::Upsert { at, .. }
            | JournalOp::Delete { at, .. }
            | JournalOp::Compacted { at } => *at,
        }
    }
}

/// Reads `<dir>/<map>` and `<dir>/<map>.journal`.
#[derive(Debug, Clone)]
pub struct FilesSource {
    kind: MapKind,
    dir: PathBuf,
}

impl FilesSource {
    pub fn new(kind: MapKind, dir: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            dir: dir.into(),
        }
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(self.kind.as_str())
    }

    pub fn journal_path(&self) -> PathBuf {
        self.dir.join(format!("{}.journal", self.kind))
    }

    fn snapshot_mtime(&self) -> Result<DateTime<Utc>, SourceError> {
        let path = self.snapshot_path();
        let modified = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .map_err(|e| self.read_failure(&path, e))?;
        Ok(DateTime::<Utc>::from(modified))
    }

    fn read_failure(&self, path: &Path, err: std::io::Error) -> SourceError {
        unavailable(self.kind, format!("cannot read {}: {err}", path.display()))
    }

    /// Parsed journal, or `None` when the exporter keeps no journal.
    fn read_journal(&self) -> Result<Option<Vec<JournalOp>>, SourceError> {
        let path = self.journal_path();
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.read_failure(&path, e)),
        };
        let mut ops = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let op: JournalOp = serde_json::from_str(line).map_err(|e| {
                protocol(
                    self.kind,
                    format!("{} line {}: {e}", path.display(), idx + 1),
                )
            })?;
            ops.push(op);
        }
        Ok(Some(ops))
    }
}

impl Source for FilesSource {
    fn kind(&self) -> MapKind {
        self.kind
    }

    fn fetch_all(&self) -> Result<Snapshot, SourceError> {
        let path = self.snapshot_path();
        let contents =
            std::fs::read_to_string(&path).map_err(|e| self.read_failure(&path, e))?;
        let marker = self.snapshot_mtime()?;
        let map = parse_map(self.kind, &contents).map_err(|(line, e)| {
            protocol(self.kind, format!("{} line {line}: {e}", path.display()))
        })?;
        tracing::debug!(map = %self.kind, records = map.len(), "read snapshot {}", path.display());
        Ok(Snapshot {
            records: map.records().cloned().collect(),
            marker: Some(marker),
        })
    }

    fn fetch_since(&self, since: DateTime<Utc>) -> Result<ChangeSet, SourceError> {
        let Some(ops) = self.read_journal()? else {
            // Without a journal the only delta we can express is "nothing".
            let marker = self.snapshot_mtime()?;
            if marker > since {
                return Err(SourceError::WatermarkTooOld {
                    map: self.kind,
                    since,
                });
            }
            return Ok(ChangeSet::empty());
        };

        if ops
            .iter()
            .any(|op| matches!(op, JournalOp::Compacted { at } if *at > since))
        {
            return Err(SourceError::WatermarkTooOld {
                map: self.kind,
                since,
            });
        }

        let mut changes = Vec::new();
        let mut marker: Option<DateTime<Utc>> = None;
        for op in ops.into_iter().filter(|op| op.at() > since) {
            marker = marker.max(Some(op.at()));
            match op {
                JournalOp::Upsert { entry, .. } => {
                    let record = parse_line(self.kind, &entry)
                        .map_err(|e| protocol(self.kind, format!("journal entry: {e}")))?;
                    changes.push(Change::Upsert(record));
                }
                JournalOp::Delete { name, .. } => changes.push(Change::Delete(name)),
                JournalOp::Compacted { .. } => {}
            }
        }
        tracing::debug!(map = %self.kind, changes = changes.len(), %since, "read journal");
        Ok(ChangeSet { changes, marker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn source_with(journal: &str) -> (TempDir, FilesSource) {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("passwd"),
            "alice:x:1000:1000::/home/alice:/bin/sh\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("passwd.journal"), journal).unwrap();
        let src = FilesSource::new(MapKind::Passwd, dir.path());
        (dir, src)
    }

    #[test]
    fn journal_entries_after_watermark_become_changes() {
        let journal = format!(
            "{}\n{}\n{}\n",
            r#"{"op":"upsert","at":"2023-11-14T22:13:21Z","entry":"old:x:1:1::/:/bin/sh"}"#,
            r#"{"op":"upsert","at":"2023-11-14T22:13:30Z","entry":"carol:x:1002:1002::/home/carol:/bin/sh"}"#,
            r#"{"op":"delete","at":"2023-11-14T22:13:40Z","name":"bob"}"#,
        );
        let (_dir, src) = source_with(&journal);
        let delta = src.fetch_since(at(25)).unwrap();
        assert_eq!(delta.changes.len(), 2);
        assert!(matches!(&delta.changes[0], Change::Upsert(r) if r.name() == "carol"));
        assert_eq!(delta.changes[1], Change::Delete("bob".into()));
        assert_eq!(delta.marker, Some(at(40)));
    }

    #[test]
    fn compaction_past_watermark_is_too_old() {
        let (_dir, src) = source_with(r#"{"op":"compacted","at":"2023-11-14T22:13:50Z"}"#);
        assert!(matches!(
            src.fetch_since(at(0)),
            Err(SourceError::WatermarkTooOld { .. })
        ));
        // A watermark newer than the compaction point is still servable.
        assert!(src.fetch_since(at(60)).unwrap().changes.is_empty());
    }

    #[test]
    fn malformed_journal_line_is_protocol_error() {
        let (_dir, src) = source_with("{not json}\n");
        assert!(matches!(
            src.fetch_since(at(0)),
            Err(SourceError::Protocol { .. })
        ));
    }

    #[test]
    fn missing_snapshot_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let src = FilesSource::new(MapKind::Group, dir.path());
        let err = src.fetch_all().unwrap_err();
        assert!(err.is_transient(), "got: {err}");
    }
}
