//! Domain types for nsscache maps.
//!
//! A [`MapData`] is the in-memory form of one map generation: an ordered set
//! of [`Record`]s keyed by name. It is built fresh for every update and thrown
//! away after publish; only the files written from it persist.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Map kinds
// ---------------------------------------------------------------------------

/// One NSS database category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapKind {
    Passwd,
    Group,
    Shadow,
    Netgroup,
}

impl MapKind {
    /// Every supported kind, in canonical order.
    pub fn all() -> &'static [MapKind] {
        &[
            MapKind::Passwd,
            MapKind::Group,
            MapKind::Shadow,
            MapKind::Netgroup,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MapKind::Passwd => "passwd",
            MapKind::Group => "group",
            MapKind::Shadow => "shadow",
            MapKind::Netgroup => "netgroup",
        }
    }

    /// Name of the secondary numeric key, for kinds that have one.
    pub fn id_field(self) -> Option<&'static str> {
        match self {
            MapKind::Passwd => Some("uid"),
            MapKind::Group => Some("gid"),
            MapKind::Shadow | MapKind::Netgroup => None,
        }
    }

    /// Whether a name index is maintained for this kind.
    ///
    /// The switch module cannot binary-search netgroup entries, so netgroup
    /// caches carry no index at all.
    pub fn has_name_index(self) -> bool {
        !matches!(self, MapKind::Netgroup)
    }

    /// Credential-bearing maps must never be world readable.
    pub fn is_sensitive(self) -> bool {
        matches!(self, MapKind::Shadow)
    }
}

impl fmt::Display for MapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MapKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "passwd" => Ok(MapKind::Passwd),
            "group" => Ok(MapKind::Group),
            "shadow" => Ok(MapKind::Shadow),
            "netgroup" => Ok(MapKind::Netgroup),
            other => Err(CoreError::UnknownMap(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// One account, as in `/etc/passwd`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub passwd: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub dir: String,
    pub shell: String,
}

/// One group, as in `/etc/group`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub name: String,
    pub passwd: String,
    pub gid: u32,
    pub members: Vec<String>,
}

/// One credential entry, as in `/etc/shadow`. Empty fields are `None`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShadowEntry {
    pub name: String,
    pub passwd: String,
    pub lstchg: Option<i64>,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub warn: Option<i64>,
    pub inact: Option<i64>,
    pub expire: Option<i64>,
    pub flag: Option<u64>,
}

/// One netgroup. `entries` is kept verbatim (triples and nested group names).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetgroupEntry {
    pub name: String,
    pub entries: String,
}

/// A single map entry of any kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Passwd(PasswdEntry),
    Group(GroupEntry),
    Shadow(ShadowEntry),
    Netgroup(NetgroupEntry),
}

impl Record {
    pub fn kind(&self) -> MapKind {
        match self {
            Record::Passwd(_) => MapKind::Passwd,
            Record::Group(_) => MapKind::Group,
            Record::Shadow(_) => MapKind::Shadow,
            Record::Netgroup(_) => MapKind::Netgroup,
        }
    }

    /// Primary key.
    pub fn name(&self) -> &str {
        match self {
            Record::Passwd(e) => &e.name,
            Record::Group(e) => &e.name,
            Record::Shadow(e) => &e.name,
            Record::Netgroup(e) => &e.name,
        }
    }

    /// Secondary numeric key (uid or gid), where the kind has one.
    pub fn id(&self) -> Option<u32> {
        match self {
            Record::Passwd(e) => Some(e.uid),
            Record::Group(e) => Some(e.gid),
            Record::Shadow(_) | Record::Netgroup(_) => None,
        }
    }
}

/// One delta item returned by an incremental fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Insert, or replace the record with the same name.
    Upsert(Record),
    /// Remove the record with this name; absent names are ignored.
    Delete(String),
}

// ---------------------------------------------------------------------------
// MapData
// ---------------------------------------------------------------------------

/// Ordered collection of records for one map kind, unique by name.
///
/// Equality ignores order: two maps are equal when they hold the same
/// records under the same names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapData {
    kind: MapKind,
    entries: IndexMap<String, Record>,
}

impl MapData {
    pub fn new(kind: MapKind) -> Self {
        Self {
            kind,
            entries: IndexMap::new(),
        }
    }

    /// Build a map from a record sequence. A later record with a name already
    /// seen replaces the earlier one in place.
    pub fn from_records(
        kind: MapKind,
        records: impl IntoIterator<Item = Record>,
    ) -> Result<Self, CoreError> {
        let mut map = Self::new(kind);
        for record in records {
            map.upsert(record)?;
        }
        Ok(map)
    }

    pub fn kind(&self) -> MapKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Record> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Records in insertion order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.entries.values()
    }

    /// Names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Insert or replace by name. Returns the replaced record, if any.
    pub fn upsert(&mut self, record: Record) -> Result<Option<Record>, CoreError> {
        if record.kind() != self.kind {
            return Err(CoreError::KindMismatch {
                map: self.kind,
                record: record.kind(),
            });
        }
        Ok(self.entries.insert(record.name().to_string(), record))
    }

    /// Remove by name, keeping the order of the remaining records.
    pub fn remove(&mut self, name: &str) -> Option<Record> {
        self.entries.shift_remove(name)
    }

    /// Apply one delta item.
    pub fn apply(&mut self, change: Change) -> Result<(), CoreError> {
        match change {
            Change::Upsert(record) => {
                self.upsert(record)?;
            }
            Change::Delete(name) => {
                self.remove(&name);
            }
        }
        Ok(())
    }

    /// Check that no two records share a uid/gid.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut seen: HashMap<u32, &str> = HashMap::new();
        for record in self.entries.values() {
            let Some(id) = record.id() else { continue };
            if let Some(first) = seen.insert(id, record.name()) {
                return Err(CoreError::DuplicateId {
                    map: self.kind,
                    id,
                    first: first.to_string(),
                    second: record.name().to_string(),
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str, uid: u32) -> Record {
        Record::Passwd(PasswdEntry {
            name: name.to_string(),
            passwd: "x".to_string(),
            uid,
            gid: uid,
            gecos: String::new(),
            dir: format!("/home/{name}"),
            shell: "/bin/bash".to_string(),
        })
    }

    #[test]
    fn map_kind_parse_and_display() {
        for kind in MapKind::all() {
            assert_eq!(kind.as_str().parse::<MapKind>().unwrap(), *kind);
            assert_eq!(kind.to_string(), kind.as_str());
        }
        assert!(matches!(
            "automount".parse::<MapKind>(),
            Err(CoreError::UnknownMap(name)) if name == "automount"
        ));
    }

    #[test]
    fn upsert_replaces_in_place() {
        let mut map = MapData::from_records(
            MapKind::Passwd,
            vec![user("alice", 1000), user("bob", 1001)],
        )
        .unwrap();
        let old = map.upsert(user("alice", 2000)).unwrap();
        assert!(old.is_some());
        let names: Vec<_> = map.names().collect();
        assert_eq!(names, vec!["alice", "bob"]);
        assert_eq!(map.get("alice").and_then(Record::id), Some(2000));
    }

    #[test]
    fn delete_is_idempotent_and_keeps_order() {
        let mut map = MapData::from_records(
            MapKind::Passwd,
            vec![user("a", 1), user("b", 2), user("c", 3)],
        )
        .unwrap();
        map.apply(Change::Delete("b".into())).unwrap();
        map.apply(Change::Delete("b".into())).unwrap();
        map.apply(Change::Delete("nobody".into())).unwrap();
        let names: Vec<_> = map.names().collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let mut map = MapData::new(MapKind::Group);
        let err = map.upsert(user("alice", 1000)).unwrap_err();
        assert!(matches!(err, CoreError::KindMismatch { .. }));
    }

    #[test]
    fn equality_ignores_order() {
        let a = MapData::from_records(MapKind::Passwd, vec![user("a", 1), user("b", 2)]).unwrap();
        let b = MapData::from_records(MapKind::Passwd, vec![user("b", 2), user("a", 1)]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let map = MapData::from_records(
            MapKind::Passwd,
            vec![user("root", 0), user("toor", 0)],
        )
        .unwrap();
        let err = map.validate().unwrap_err();
        assert!(matches!(err, CoreError::DuplicateId { id: 0, .. }), "got: {err}");
    }

    #[test]
    fn id_reuse_after_delete_validates() {
        let mut map = MapData::from_records(
            MapKind::Passwd,
            vec![user("alice", 1000), user("bob", 1001)],
        )
        .unwrap();
        // Re-use arrives before the delete that frees the id.
        map.apply(Change::Upsert(user("carol", 1001))).unwrap();
        map.apply(Change::Delete("bob".into())).unwrap();
        map.validate().expect("final map has unique ids");
    }
}
