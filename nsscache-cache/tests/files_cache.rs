use std::fs;

use tempfile::TempDir;

use nsscache_cache::index::IndexKey;
use nsscache_cache::{Cache, CacheBackend, PublishOutcome, Watermark};
use nsscache_core::format::parse_line;
use nsscache_core::{CacheConfig, MapData, MapKind};

fn map(kind: MapKind, lines: &[&str]) -> MapData {
    MapData::from_records(kind, lines.iter().map(|l| parse_line(kind, l).unwrap())).unwrap()
}

fn open(dir: &TempDir, kind: MapKind) -> CacheBackend {
    CacheBackend::open(kind, &CacheConfig::files(dir.path()), dir.path()).unwrap()
}

const V1: &[&str] = &[
    "alice:x:1000:1000:Alice:/home/alice:/bin/bash",
    "bob:x:1001:1001:Bob:/home/bob:/bin/bash",
];
const V2: &[&str] = &[
    "alice:x:1000:1000:Alice:/home/alice:/bin/bash",
    "carol:x:1002:1002:Carol:/home/carol:/bin/zsh",
];

#[test]
fn publish_writes_primary_and_both_indexes() {
    let dir = TempDir::new().unwrap();
    let cache = open(&dir, MapKind::Passwd);
    let staged = cache.write_generation(&map(MapKind::Passwd, V1)).unwrap();
    assert_eq!(cache.publish(staged).unwrap(), PublishOutcome::Published);

    let primary = dir.path().join("passwd.cache");
    assert_eq!(
        fs::read_to_string(&primary).unwrap(),
        format!("{}\n{}\n", V1[0], V1[1])
    );
    assert!(dir.path().join("passwd.cache.ixname").exists());
    assert!(dir.path().join("passwd.cache.ixuid").exists());
    assert!(cache.verify_indexes().unwrap().is_empty());

    let active = cache.read_active().unwrap();
    assert_eq!(active.map, map(MapKind::Passwd, V1));
    assert!(active.watermark.is_none());
}

#[test]
fn full_rewrite_is_byte_identical() {
    let dir = TempDir::new().unwrap();
    let cache = open(&dir, MapKind::Passwd);
    cache
        .publish(cache.write_generation(&map(MapKind::Passwd, V1)).unwrap())
        .unwrap();
    let before: Vec<Vec<u8>> = ["passwd.cache", "passwd.cache.ixname", "passwd.cache.ixuid"]
        .iter()
        .map(|f| fs::read(dir.path().join(f)).unwrap())
        .collect();

    // Force a real rewrite by removing an index first.
    fs::remove_file(dir.path().join("passwd.cache.ixuid")).unwrap();
    let outcome = cache
        .publish(cache.write_generation(&map(MapKind::Passwd, V1)).unwrap())
        .unwrap();
    assert_eq!(outcome, PublishOutcome::Published);

    let after: Vec<Vec<u8>> = ["passwd.cache", "passwd.cache.ixname", "passwd.cache.ixuid"]
        .iter()
        .map(|f| fs::read(dir.path().join(f)).unwrap())
        .collect();
    assert_eq!(before, after);
}

#[test]
fn crash_between_stage_and_rename_keeps_previous_generation() {
    let dir = TempDir::new().unwrap();
    let cache = open(&dir, MapKind::Passwd);
    cache
        .publish(cache.write_generation(&map(MapKind::Passwd, V1)).unwrap())
        .unwrap();

    // A killed writer never runs Drop: its staged files stay behind.
    let staged = cache.write_generation(&map(MapKind::Passwd, V2)).unwrap();
    let leftovers = staged.staged_paths();
    std::mem::forget(staged);
    assert!(leftovers.iter().all(|p| p.exists()));

    let active = cache.read_active().unwrap();
    assert_eq!(active.map, map(MapKind::Passwd, V1));
    assert!(cache.verify_indexes().unwrap().is_empty());

    // The next writer reuses the same temporary names.
    cache
        .publish(cache.write_generation(&map(MapKind::Passwd, V2)).unwrap())
        .unwrap();
    assert_eq!(cache.read_active().unwrap().map, map(MapKind::Passwd, V2));
    assert!(leftovers.iter().all(|p| !p.exists()));
}

#[test]
#[cfg(unix)]
fn shadow_is_not_world_readable() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let cache = open(&dir, MapKind::Shadow);
    let shadow = map(MapKind::Shadow, &["alice:$6$x$y:19000:0:99999:7:::"]);
    cache.publish(cache.write_generation(&shadow).unwrap()).unwrap();

    for name in ["shadow.cache", "shadow.cache.ixname"] {
        let mode = fs::metadata(dir.path().join(name)).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o440, "{name}");
    }
    assert!(!dir.path().join("shadow.cache.ixuid").exists());

    let passwd = open(&dir, MapKind::Passwd);
    passwd
        .publish(passwd.write_generation(&map(MapKind::Passwd, V1)).unwrap())
        .unwrap();
    let mode = fs::metadata(dir.path().join("passwd.cache"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o644);
}

#[test]
fn netgroup_has_no_index() {
    let dir = TempDir::new().unwrap();
    let cache = open(&dir, MapKind::Netgroup);
    let ng = map(MapKind::Netgroup, &["admins (host1,alice,)", "ops admins"]);
    let staged = cache.write_generation(&ng).unwrap();
    assert_eq!(staged.staged_paths().len(), 1);
    cache.publish(staged).unwrap();
    assert!(cache.verify_indexes().unwrap().is_empty());
}

#[test]
fn tampered_index_is_reported() {
    let dir = TempDir::new().unwrap();
    let cache = open(&dir, MapKind::Group);
    let groups = map(MapKind::Group, &["staff:x:50:alice,bob", "wheel:x:10:alice"]);
    cache.publish(cache.write_generation(&groups).unwrap()).unwrap();

    // Swap in an index built for a different primary.
    let other = nsscache_cache::index::build(vec![("staff".into(), 3)]);
    fs::write(dir.path().join("group.cache.ixname"), other).unwrap();
    let problems = cache.verify_indexes().unwrap();
    assert!(!problems.is_empty());
    assert!(problems.iter().any(|p| p.contains("wheel")), "{problems:?}");

    assert_eq!(IndexKey::for_kind(MapKind::Group).len(), 2);
}

#[test]
fn republish_replaces_a_tampered_index() {
    let dir = TempDir::new().unwrap();
    let cache = open(&dir, MapKind::Passwd);
    let users = map(MapKind::Passwd, V1);
    cache.publish(cache.write_generation(&users).unwrap()).unwrap();

    let bogus = nsscache_cache::index::build(vec![("alice".into(), 7)]);
    fs::write(dir.path().join("passwd.cache.ixname"), bogus).unwrap();
    assert!(!cache.verify_indexes().unwrap().is_empty());

    let outcome = cache.publish(cache.write_generation(&users).unwrap()).unwrap();
    assert_eq!(outcome, PublishOutcome::Published);
    assert!(cache.verify_indexes().unwrap().is_empty());

    let outcome = cache.publish(cache.write_generation(&users).unwrap()).unwrap();
    assert_eq!(outcome, PublishOutcome::Unchanged);
}

#[test]
fn watermark_commits_to_timestamp_dir() {
    let cache_dir = TempDir::new().unwrap();
    let ts_dir = TempDir::new().unwrap();
    let cache = CacheBackend::open(
        MapKind::Group,
        &CacheConfig::files(cache_dir.path()),
        ts_dir.path(),
    )
    .unwrap();
    let wm = Watermark {
        record_count: Some(3),
        ..Watermark::default()
    };
    cache.commit_watermark(&wm).unwrap();
    assert!(ts_dir.path().join("timestamp-group.json").exists());
    assert_eq!(cache.read_watermark().unwrap(), Some(wm));
}
