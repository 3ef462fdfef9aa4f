//! Colon-delimited line codecs for the system databases.
//!
//! | map      | line syntax                                            |
//! |----------|--------------------------------------------------------|
//! | passwd   | `name:passwd:uid:gid:gecos:dir:shell`                  |
//! | group    | `name:passwd:gid:member,member,...`                    |
//! | shadow   | `name:passwd:lstchg:min:max:warn:inact:expire:flag`    |
//! | netgroup | `name entries...`                                      |
//!
//! [`Record`]'s `Display` impl renders a line without the trailing newline;
//! [`parse_line`] is its inverse.

use std::fmt;
use std::str::FromStr;

use crate::error::FormatError;
use crate::types::{
    GroupEntry, MapData, MapKind, NetgroupEntry, PasswdEntry, Record, ShadowEntry,
};

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Record::Passwd(e) => write!(
                f,
                "{}:{}:{}:{}:{}:{}:{}",
                e.name, e.passwd, e.uid, e.gid, e.gecos, e.dir, e.shell
            ),
            Record::Group(e) => write!(
                f,
                "{}:{}:{}:{}",
                e.name,
                e.passwd,
                e.gid,
                e.members.join(",")
            ),
            Record::Shadow(e) => write!(
                f,
                "{}:{}:{}:{}:{}:{}:{}:{}:{}",
                e.name,
                e.passwd,
                opt(e.lstchg),
                opt(e.min),
                opt(e.max),
                opt(e.warn),
                opt(e.inact),
                opt(e.expire),
                opt(e.flag),
            ),
            Record::Netgroup(e) if e.entries.is_empty() => f.write_str(&e.name),
            Record::Netgroup(e) => write!(f, "{} {}", e.name, e.entries),
        }
    }
}

fn opt<T: fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Parse a single line (no trailing newline) into a record of `kind`.
pub fn parse_line(kind: MapKind, line: &str) -> Result<Record, FormatError> {
    match kind {
        MapKind::Passwd => {
            let f = fields(kind, line, 7)?;
            Ok(Record::Passwd(PasswdEntry {
                name: name(kind, f[0])?,
                passwd: f[1].to_string(),
                uid: number(kind, "uid", f[2])?,
                gid: number(kind, "gid", f[3])?,
                gecos: f[4].to_string(),
                dir: f[5].to_string(),
                shell: f[6].to_string(),
            }))
        }
        MapKind::Group => {
            let f = fields(kind, line, 4)?;
            Ok(Record::Group(GroupEntry {
                name: name(kind, f[0])?,
                passwd: f[1].to_string(),
                gid: number(kind, "gid", f[2])?,
                members: f[3]
                    .split(',')
                    .filter(|m| !m.is_empty())
                    .map(str::to_string)
                    .collect(),
            }))
        }
        MapKind::Shadow => {
            let f = fields(kind, line, 9)?;
            Ok(Record::Shadow(ShadowEntry {
                name: name(kind, f[0])?,
                passwd: f[1].to_string(),
                lstchg: optional(kind, "lstchg", f[2])?,
                min: optional(kind, "min", f[3])?,
                max: optional(kind, "max", f[4])?,
                warn: optional(kind, "warn", f[5])?,
                inact: optional(kind, "inact", f[6])?,
                expire: optional(kind, "expire", f[7])?,
                flag: optional(kind, "flag", f[8])?,
            }))
        }
        MapKind::Netgroup => {
            let (n, entries) = match line.split_once(' ') {
                Some((n, rest)) => (n, rest.trim()),
                None => (line, ""),
            };
            Ok(Record::Netgroup(NetgroupEntry {
                name: name(kind, n)?,
                entries: entries.to_string(),
            }))
        }
    }
}

/// Parse a whole file body. Blank lines and `#` comments are skipped.
///
/// On failure returns the 1-based line number with the error.
pub fn parse_map(kind: MapKind, text: &str) -> Result<MapData, (usize, FormatError)> {
    let mut map = MapData::new(kind);
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let record = parse_line(kind, line).map_err(|e| (idx + 1, e))?;
        // parse_line only ever yields records of `kind`.
        let _ = map.upsert(record);
    }
    Ok(map)
}

fn fields(kind: MapKind, line: &str, expected: usize) -> Result<Vec<&str>, FormatError> {
    let f: Vec<&str> = line.split(':').collect();
    if f.len() != expected {
        return Err(FormatError::FieldCount {
            map: kind,
            expected,
            found: f.len(),
        });
    }
    Ok(f)
}

fn name(kind: MapKind, raw: &str) -> Result<String, FormatError> {
    if raw.is_empty() {
        return Err(FormatError::EmptyName { map: kind });
    }
    Ok(raw.to_string())
}

fn number<T: FromStr>(kind: MapKind, field: &'static str, raw: &str) -> Result<T, FormatError> {
    raw.parse().map_err(|_| FormatError::Number {
        map: kind,
        field,
        value: raw.to_string(),
    })
}

fn optional<T: FromStr>(
    kind: MapKind,
    field: &'static str,
    raw: &str,
) -> Result<Option<T>, FormatError> {
    if raw.is_empty() {
        return Ok(None);
    }
    number(kind, field, raw).map(Some)
}
