//! `files` cache: flat files in the system database syntax plus indexes.
//!
//! ## Generation lifecycle
//!
//! 1. Render the map into the primary text, recording each line's offset.
//! 2. Build one index per [`IndexKey`] from those offsets.
//! 3. Write every file to `<final>.nsscache.tmp`, fsync, chmod.
//! 4. Read each staged file back and check it against the map.
//! 5. On publish: rename the primary, then each index, then fsync the dir.
//!
//! Steps 1-4 never touch the active files. A [`StagedGeneration`] dropped
//! before step 5 removes its temporary files.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use nsscache_core::format::parse_map;
use nsscache_core::{CacheConfig, MapData, MapKind};

use crate::error::{io_err, CacheError};
use crate::index::{self, IndexKey};
use crate::watermark::{self, Watermark};
use crate::{ActiveGeneration, PublishOutcome};

const TMP_SUFFIX: &str = "nsscache.tmp";
const MODE_PUBLIC: u32 = 0o644;
const MODE_SENSITIVE: u32 = 0o440;

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// The serialized form of one generation, before it touches disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub primary: String,
    pub indexes: Vec<(IndexKey, Vec<u8>)>,
    pub digest: String,
}

/// Render `map` into primary text and index bytes.
pub fn render(map: &MapData) -> Rendered {
    let keys = IndexKey::for_kind(map.kind());
    let mut primary = String::new();
    let mut entries: Vec<Vec<(String, u64)>> = vec![Vec::new(); keys.len()];

    for record in map.records() {
        let offset = primary.len() as u64;
        for (key, bucket) in keys.iter().zip(entries.iter_mut()) {
            if let Some(k) = key.key_of(record) {
                bucket.push((k, offset));
            }
        }
        primary.push_str(&record.to_string());
        primary.push('\n');
    }

    let indexes = keys
        .into_iter()
        .zip(entries)
        .map(|(key, bucket)| (key, index::build(bucket)))
        .collect();
    let digest = digest(primary.as_bytes());
    Rendered {
        primary,
        indexes,
        digest,
    }
}

/// Hex SHA-256 of `bytes`.
pub fn digest(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}

// ---------------------------------------------------------------------------
// Staged generation
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct StagedFile {
    tmp: PathBuf,
    target: PathBuf,
    digest: String,
}

/// A fully written, not yet visible generation.
#[derive(Debug)]
pub struct StagedGeneration {
    kind: MapKind,
    // Primary first; publish renames in this order.
    files: Vec<StagedFile>,
    digest: String,
    record_count: usize,
}

impl StagedGeneration {
    pub fn kind(&self) -> MapKind {
        self.kind
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    pub fn staged_paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|f| f.tmp.clone()).collect()
    }
}

impl Drop for StagedGeneration {
    fn drop(&mut self) {
        for file in &self.files {
            match std::fs::remove_file(&file.tmp) {
                Ok(()) => tracing::debug!("discarded staged {}", file.tmp.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("cannot remove {}: {e}", file.tmp.display()),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// FilesCache
// ---------------------------------------------------------------------------

/// Flat-file cache for one map.
#[derive(Debug, Clone)]
pub struct FilesCache {
    kind: MapKind,
    dir: PathBuf,
    suffix: String,
    timestamp_dir: PathBuf,
}

impl FilesCache {
    pub fn new(kind: MapKind, config: &CacheConfig, timestamp_dir: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            dir: config.dir.clone(),
            suffix: config.suffix.clone(),
            timestamp_dir: timestamp_dir.into(),
        }
    }

    pub fn kind(&self) -> MapKind {
        self.kind
    }

    /// `<dir>/<map>.<suffix>`, or `<dir>/<map>` with an empty suffix.
    pub fn primary_path(&self) -> PathBuf {
        if self.suffix.is_empty() {
            self.dir.join(self.kind.as_str())
        } else {
            self.dir.join(format!("{}.{}", self.kind, self.suffix))
        }
    }

    pub fn index_path(&self, key: IndexKey) -> PathBuf {
        with_suffix(&self.primary_path(), &key.suffix(self.kind))
    }

    pub fn index_paths(&self) -> Vec<(IndexKey, PathBuf)> {
        IndexKey::for_kind(self.kind)
            .into_iter()
            .map(|k| (k, self.index_path(k)))
            .collect()
    }

    pub fn watermark_path(&self) -> PathBuf {
        watermark::store_path(&self.timestamp_dir, self.kind)
    }

    fn mode(&self) -> u32 {
        if self.kind.is_sensitive() {
            MODE_SENSITIVE
        } else {
            MODE_PUBLIC
        }
    }

    /// Raw bytes of the active primary file.
    pub fn read_primary(&self) -> Result<Vec<u8>, CacheError> {
        let path = self.primary_path();
        std::fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => CacheError::NotFound {
                map: self.kind,
                path: path.clone(),
            },
            _ => io_err(&path, e),
        })
    }

    pub fn read_active(&self) -> Result<ActiveGeneration, CacheError> {
        let path = self.primary_path();
        let bytes = self.read_primary()?;
        let text = String::from_utf8(bytes).map_err(|_| CacheError::Corrupt {
            map: self.kind,
            path: path.clone(),
            message: "not valid UTF-8".to_string(),
        })?;
        let map = parse_map(self.kind, &text).map_err(|(line, e)| CacheError::Corrupt {
            map: self.kind,
            path: path.clone(),
            message: format!("line {line}: {e}"),
        })?;
        let watermark = self.read_watermark()?;
        Ok(ActiveGeneration { map, watermark })
    }

    pub fn read_watermark(&self) -> Result<Option<Watermark>, CacheError> {
        watermark::load(&self.timestamp_dir, self.kind)
    }

    pub fn commit_watermark(&self, watermark: &Watermark) -> Result<(), CacheError> {
        watermark::save(&self.timestamp_dir, self.kind, watermark)
    }

    /// Digest of the active primary file, or `None` when there is none.
    pub fn active_digest(&self) -> Result<Option<String>, CacheError> {
        match self.read_primary() {
            Ok(bytes) => Ok(Some(digest(&bytes))),
            Err(CacheError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Serialize `map` next to the active files without making it visible.
    pub fn write_generation(&self, map: &MapData) -> Result<StagedGeneration, CacheError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        let rendered = render(map);

        let mut staged = StagedGeneration {
            kind: self.kind,
            files: Vec::new(),
            digest: rendered.digest.clone(),
            record_count: map.len(),
        };

        let primary = self.primary_path();
        self.stage_file(&mut staged, &primary, rendered.primary.as_bytes())?;
        readback_primary(map, &staged.files[0].tmp)?;

        for (key, bytes) in &rendered.indexes {
            let target = self.index_path(*key);
            self.stage_file(&mut staged, &target, bytes)?;
            let tmp = &staged.files[staged.files.len() - 1].tmp;
            readback_index(tmp, bytes.len(), index_len(map, *key))?;
        }

        tracing::debug!(
            map = %self.kind,
            records = map.len(),
            digest = %rendered.digest,
            "staged generation"
        );
        Ok(staged)
    }

    fn stage_file(
        &self,
        staged: &mut StagedGeneration,
        target: &Path,
        bytes: &[u8],
    ) -> Result<(), CacheError> {
        let tmp = with_suffix(target, TMP_SUFFIX);
        // Registered before writing so a failed write is still cleaned up.
        staged.files.push(StagedFile {
            tmp: tmp.clone(),
            target: target.to_path_buf(),
            digest: digest(bytes),
        });
        // A killed writer may have left a read-only tmp behind.
        match std::fs::remove_file(&tmp) {
            Ok(()) => tracing::warn!("removed stale {}", tmp.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&tmp, e)),
        }
        let mut file = std::fs::File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
        file.write_all(bytes).map_err(|e| io_err(&tmp, e))?;
        file.sync_all().map_err(|e| io_err(&tmp, e))?;
        set_mode(&tmp, self.mode())?;
        Ok(())
    }

    /// Make `generation` the active one.
    ///
    /// Skipped when the active primary and every index are already
    /// byte-identical to the staged ones.
    pub fn publish(&self, mut generation: StagedGeneration) -> Result<PublishOutcome, CacheError> {
        if self.is_active(&generation)? {
            tracing::info!(map = %self.kind, "active generation already identical");
            return Ok(PublishOutcome::Unchanged);
        }

        let files = std::mem::take(&mut generation.files);
        let mut remaining = files.into_iter();
        while let Some(file) = remaining.next() {
            if let Err(e) = std::fs::rename(&file.tmp, &file.target) {
                // Leave the rest for Drop to clean up.
                generation.files.push(file);
                generation.files.extend(remaining);
                return Err(io_err(&generation.files[0].target, e));
            }
        }
        sync_dir(&self.dir)?;

        tracing::info!(
            map = %self.kind,
            records = generation.record_count,
            "published {}",
            self.primary_path().display()
        );
        Ok(PublishOutcome::Published)
    }

    fn is_active(&self, generation: &StagedGeneration) -> Result<bool, CacheError> {
        for file in &generation.files {
            let active = match std::fs::read(&file.target) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
                Err(e) => return Err(io_err(&file.target, e)),
            };
            if digest(&active) != file.digest {
                return Ok(false);
            }
        }
        Ok(!generation.files.is_empty())
    }

    /// Check every index file against the active primary.
    pub fn verify_indexes(&self) -> Result<Vec<String>, CacheError> {
        let primary = self.read_primary()?;
        let mut problems = Vec::new();
        for (key, path) in self.index_paths() {
            match std::fs::read(&path) {
                Ok(bytes) => problems.extend(index::check(self.kind, key, &primary, &bytes)),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    problems.push(format!("{} is missing", path.display()));
                }
                Err(e) => return Err(io_err(&path, e)),
            }
        }
        Ok(problems)
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}.{suffix}", path.display()))
}

fn index_len(map: &MapData, key: IndexKey) -> usize {
    map.records().filter(|r| key.key_of(r).is_some()).count()
}

fn readback_primary(map: &MapData, tmp: &Path) -> Result<(), CacheError> {
    let fail = |message: String| CacheError::Readback {
        path: tmp.to_path_buf(),
        message,
    };
    let text = std::fs::read_to_string(tmp).map_err(|e| io_err(tmp, e))?;
    let written = parse_map(map.kind(), &text).map_err(|(line, e)| fail(format!("line {line}: {e}")))?;
    if written.len() != map.len() {
        return Err(fail(format!(
            "wrote {} records, expected {}",
            written.len(),
            map.len()
        )));
    }
    if let Some(missing) = map.names().find(|n| !written.contains(n)) {
        return Err(fail(format!("'{missing}' did not read back")));
    }
    Ok(())
}

fn readback_index(tmp: &Path, expected_bytes: usize, expected_keys: usize) -> Result<(), CacheError> {
    let bytes = std::fs::read(tmp).map_err(|e| io_err(tmp, e))?;
    let fail = |message: String| CacheError::Readback {
        path: tmp.to_path_buf(),
        message,
    };
    if bytes.len() != expected_bytes {
        return Err(fail(format!(
            "read {} bytes, expected {expected_bytes}",
            bytes.len()
        )));
    }
    let entries = index::parse(&bytes).map_err(fail)?;
    if entries.len() != expected_keys {
        return Err(fail(format!(
            "indexed {} keys, expected {expected_keys}",
            entries.len()
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), CacheError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), CacheError> {
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), CacheError> {
    std::fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| io_err(dir, e))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), CacheError> {
    Ok(())
}
