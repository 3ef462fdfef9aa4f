//! Per-map cross-process lock.
//!
//! `<lock_dir>/nsscache-<map>.lock` held with an exclusive `flock`. The
//! kernel drops the lock when the holding process exits, so a killed
//! updater never blocks the next run. The file body names the holder.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use fs2::FileExt;

use nsscache_core::MapKind;

use crate::error::LockError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Held lock; released on drop.
#[derive(Debug)]
pub struct MapLock {
    map: MapKind,
    path: PathBuf,
    file: File,
}

impl MapLock {
    pub fn path_for(lock_dir: &Path, map: MapKind) -> PathBuf {
        lock_dir.join(format!("nsscache-{map}.lock"))
    }

    /// Acquire the lock for `map`, polling until `timeout` elapses. A zero
    /// timeout makes a single attempt.
    pub fn acquire(lock_dir: &Path, map: MapKind, timeout: Duration) -> Result<Self, LockError> {
        std::fs::create_dir_all(lock_dir).map_err(|e| io_err(lock_dir, e))?;
        let path = Self::path_for(lock_dir, map);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(LockError::Busy {
                            map,
                            holder: describe_holder(&mut file),
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(io_err(&path, e)),
            }
        }

        let stamp = format!(
            "{}\n{}\n",
            std::process::id(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let write = |file: &mut File| -> std::io::Result<()> {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(stamp.as_bytes())?;
            file.sync_all()
        };
        write(&mut file).map_err(|e| io_err(&path, e))?;

        tracing::debug!(map = %map, "acquired {}", path.display());
        Ok(Self { map, path, file })
    }

    pub fn map(&self) -> MapKind {
        self.map
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MapLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("cannot release {}: {e}", self.path.display());
        } else {
            tracing::debug!(map = %self.map, "released {}", self.path.display());
        }
    }
}

fn describe_holder(file: &mut File) -> String {
    let mut body = String::new();
    if file.seek(SeekFrom::Start(0)).is_err() || file.read_to_string(&mut body).is_err() {
        return "holder unknown".to_string();
    }
    let mut lines = body.lines();
    match (lines.next(), lines.next()) {
        (Some(pid), Some(since)) => format!("held by pid {pid} since {since}"),
        (Some(pid), None) if !pid.is_empty() => format!("held by pid {pid}"),
        _ => "holder unknown".to_string(),
    }
}

fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> LockError {
    LockError::Io {
        path: path.into(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_acquire_is_busy_until_first_drops() {
        let dir = TempDir::new().unwrap();
        let first = MapLock::acquire(dir.path(), MapKind::Passwd, Duration::ZERO).unwrap();

        let err = MapLock::acquire(dir.path(), MapKind::Passwd, Duration::ZERO).unwrap_err();
        let LockError::Busy { holder, .. } = err else {
            panic!("expected busy, got {err}");
        };
        assert!(holder.contains(&std::process::id().to_string()), "{holder}");

        drop(first);
        MapLock::acquire(dir.path(), MapKind::Passwd, Duration::ZERO).expect("free again");
    }

    #[test]
    fn different_maps_do_not_contend() {
        let dir = TempDir::new().unwrap();
        let _passwd = MapLock::acquire(dir.path(), MapKind::Passwd, Duration::ZERO).unwrap();
        let group = MapLock::acquire(dir.path(), MapKind::Group, Duration::ZERO).unwrap();
        assert_eq!(group.path(), dir.path().join("nsscache-group.lock"));
    }

    #[test]
    fn bounded_wait_picks_up_released_lock() {
        let dir = TempDir::new().unwrap();
        let held = MapLock::acquire(dir.path(), MapKind::Shadow, Duration::ZERO).unwrap();
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            drop(held);
        });
        let lock = MapLock::acquire(dir.path(), MapKind::Shadow, Duration::from_secs(5));
        releaser.join().unwrap();
        assert!(lock.is_ok());
    }
}
