//! Lookup indexes read by the libnss-cache switch module.
//!
//! One line per key, sorted by key bytes:
//!
//! ```text
//! key NUL offset NUL padding '\n'
//! ```
//!
//! `offset` is the decimal byte offset of the record's line in the primary
//! file. `padding` is NUL bytes so that every line in the file has the same
//! length, which lets the reader binary-search by seeking.

use std::collections::HashSet;

use nsscache_core::format::parse_line;
use nsscache_core::{MapKind, Record};

/// Which record field an index is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKey {
    Name,
    /// uid for passwd, gid for group.
    Id,
}

impl IndexKey {
    /// Indexes maintained for `kind`, in publish order.
    pub fn for_kind(kind: MapKind) -> Vec<IndexKey> {
        let mut keys = Vec::new();
        if kind.has_name_index() {
            keys.push(IndexKey::Name);
        }
        if kind.id_field().is_some() {
            keys.push(IndexKey::Id);
        }
        keys
    }

    /// File suffix appended to the primary path (`ixname`, `ixuid`, `ixgid`).
    pub fn suffix(self, kind: MapKind) -> String {
        match self {
            IndexKey::Name => "ixname".to_string(),
            IndexKey::Id => format!("ix{}", kind.id_field().unwrap_or("id")),
        }
    }

    pub fn key_of(self, record: &Record) -> Option<String> {
        match self {
            IndexKey::Name => Some(record.name().to_string()),
            IndexKey::Id => record.id().map(|id| id.to_string()),
        }
    }
}

/// Render index bytes from `(key, offset)` pairs.
pub fn build(mut entries: Vec<(String, u64)>) -> Vec<u8> {
    entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
    let positions: Vec<String> = entries.iter().map(|(_, off)| off.to_string()).collect();
    let key_len = entries.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    let pos_len = positions.iter().map(String::len).max().unwrap_or(0);
    let width = key_len + pos_len;

    let mut out = Vec::with_capacity(entries.len() * (width + 3));
    for ((key, _), pos) in entries.iter().zip(&positions) {
        out.extend_from_slice(key.as_bytes());
        out.push(0);
        out.extend_from_slice(pos.as_bytes());
        out.push(0);
        out.resize(out.len() + width - key.len() - pos.len(), 0);
        out.push(b'\n');
    }
    out
}

/// Parse index bytes back into `(key, offset)` pairs, in file order.
pub fn parse(bytes: &[u8]) -> Result<Vec<(String, u64)>, String> {
    let mut entries = Vec::new();
    let mut width = None;
    for (idx, line) in bytes.split(|b| *b == b'\n').enumerate() {
        if line.is_empty() {
            continue;
        }
        if *width.get_or_insert(line.len()) != line.len() {
            return Err(format!("line {} has a different length", idx + 1));
        }
        let mut parts = line.splitn(3, |b| *b == 0);
        let (Some(key), Some(pos), Some(_)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(format!("line {} is missing NUL separators", idx + 1));
        };
        let key = String::from_utf8(key.to_vec())
            .map_err(|_| format!("line {} key is not UTF-8", idx + 1))?;
        let offset = std::str::from_utf8(pos)
            .ok()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| format!("line {} has an invalid offset", idx + 1))?;
        entries.push((key, offset));
    }
    Ok(entries)
}

/// Check an index against the primary file it claims to describe.
///
/// Returns human-readable problems; an empty list means consistent.
pub fn check(kind: MapKind, key: IndexKey, primary: &[u8], index: &[u8]) -> Vec<String> {
    let entries = match parse(index) {
        Ok(entries) => entries,
        Err(e) => return vec![e],
    };
    let label = key.suffix(kind);
    let mut problems = Vec::new();

    let mut sorted = true;
    for pair in entries.windows(2) {
        if pair[0].0.as_bytes() > pair[1].0.as_bytes() {
            sorted = false;
        }
    }
    if !sorted {
        problems.push(format!("{label}: keys are not sorted"));
    }

    let mut indexed = HashSet::new();
    for (k, offset) in &entries {
        indexed.insert(k.as_str());
        match record_at(kind, primary, *offset) {
            Some(record) if key.key_of(&record).as_deref() == Some(k.as_str()) => {}
            Some(_) => problems.push(format!("{label}: '{k}' points at another record")),
            None => problems.push(format!("{label}: '{k}' points at no record (offset {offset})")),
        }
    }

    let text = String::from_utf8_lossy(primary);
    for line in text.lines().filter(|l| !l.is_empty()) {
        if let Ok(record) = parse_line(kind, line) {
            if let Some(k) = key.key_of(&record) {
                if !indexed.contains(k.as_str()) {
                    problems.push(format!("{label}: '{k}' is not indexed"));
                }
            }
        }
    }
    problems
}

fn record_at(kind: MapKind, primary: &[u8], offset: u64) -> Option<Record> {
    let start = usize::try_from(offset).ok()?;
    if start >= primary.len() || (start > 0 && primary[start - 1] != b'\n') {
        return None;
    }
    let rest = &primary[start..];
    let end = rest.iter().position(|b| *b == b'\n').unwrap_or(rest.len());
    let line = std::str::from_utf8(&rest[..end]).ok()?;
    parse_line(kind, line).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_are_sorted_and_padded_to_equal_length() {
        let bytes = build(vec![
            ("foo".into(), 0),
            ("bar".into(), 15),
            ("quux".into(), 30),
        ]);
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.split_inclusive('\n').collect();
        assert_eq!(
            lines,
            vec!["bar\x0015\x00\x00\n", "foo\x000\x00\x00\x00\n", "quux\x0030\x00\n"]
        );
    }

    #[test]
    fn numeric_keys_sort_as_bytes() {
        let bytes = build(vec![("9".into(), 0), ("10".into(), 20)]);
        let keys: Vec<String> = parse(&bytes).unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["10", "9"]);
    }

    #[test]
    fn empty_map_has_empty_index() {
        assert!(build(Vec::new()).is_empty());
        assert!(parse(b"").unwrap().is_empty());
    }

    #[test]
    fn parse_rejects_ragged_lines() {
        assert!(parse(b"a\x000\x00\x00\nbb\x0010\x00\x00\x00\x00\n").is_err());
    }

    #[test]
    fn check_flags_wrong_offsets_and_missing_keys() {
        let primary = b"alice:x:1000:1000::/home/alice:/bin/sh\nbob:x:1001:1001::/home/bob:/bin/sh\n";
        let good = build(vec![("alice".into(), 0), ("bob".into(), 39)]);
        assert!(check(MapKind::Passwd, IndexKey::Name, primary, &good).is_empty());

        let stale = build(vec![("alice".into(), 5)]);
        let problems = check(MapKind::Passwd, IndexKey::Name, primary, &stale);
        assert!(problems.iter().any(|p| p.contains("points at no record")));
        assert!(problems.iter().any(|p| p.contains("'bob' is not indexed")));
    }

    #[test]
    fn suffixes_follow_kind() {
        assert_eq!(IndexKey::Id.suffix(MapKind::Passwd), "ixuid");
        assert_eq!(IndexKey::Id.suffix(MapKind::Group), "ixgid");
        assert_eq!(IndexKey::for_kind(MapKind::Shadow), vec![IndexKey::Name]);
        assert!(IndexKey::for_kind(MapKind::Netgroup).is_empty());
    }
}
