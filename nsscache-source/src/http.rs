//! `http` source: a map file served by a web server in line syntax.
//!
//! The server's `Last-Modified` header is the modification marker. Deltas
//! are conditional GETs: `304 Not Modified` means nothing changed, while a
//! full body means the server cannot express a delta and the caller has to
//! fall back to a full fetch.

use std::io::Read;
use std::time::Duration;

use chrono::{DateTime, Utc};

use nsscache_core::format::parse_map;
use nsscache_core::MapKind;

use crate::error::{protocol, unavailable, SourceError};
use crate::{ChangeSet, Snapshot, Source};

const USER_AGENT: &str = "nsscache";

/// Fetches one map from a fixed URL.
pub struct HttpSource {
    kind: MapKind,
    url: String,
    agent: ureq::Agent,
}

impl std::fmt::Debug for HttpSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSource")
            .field("kind", &self.kind)
            .field("url", &self.url)
            .finish()
    }
}

impl HttpSource {
    pub fn new(kind: MapKind, url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build();
        Self {
            kind,
            url: url.into(),
            agent,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn get(&self, since: Option<DateTime<Utc>>) -> Result<ureq::Response, SourceError> {
        let mut request = self.agent.get(&self.url);
        if let Some(since) = since {
            request = request.set("If-Modified-Since", &http_date(since));
        }
        request.call().map_err(|e| self.classify(e))
    }

    fn classify(&self, err: ureq::Error) -> SourceError {
        match err {
            ureq::Error::Status(code, _) if is_transient_status(code) => {
                unavailable(self.kind, format!("GET {} returned {code}", self.url))
            }
            ureq::Error::Status(code, _) => {
                protocol(self.kind, format!("GET {} returned {code}", self.url))
            }
            ureq::Error::Transport(t) => unavailable(self.kind, format!("GET {}: {t}", self.url)),
        }
    }

    fn read_snapshot(&self, response: ureq::Response) -> Result<Snapshot, SourceError> {
        let marker = last_modified(&response);
        let mut body = String::new();
        response
            .into_reader()
            .read_to_string(&mut body)
            .map_err(|e| unavailable(self.kind, format!("reading {}: {e}", self.url)))?;
        let map = parse_map(self.kind, &body)
            .map_err(|(line, e)| protocol(self.kind, format!("{} line {line}: {e}", self.url)))?;
        Ok(Snapshot {
            records: map.records().cloned().collect(),
            marker,
        })
    }
}

impl Source for HttpSource {
    fn kind(&self) -> MapKind {
        self.kind
    }

    fn fetch_all(&self) -> Result<Snapshot, SourceError> {
        let response = self.get(None)?;
        let snapshot = self.read_snapshot(response)?;
        tracing::debug!(map = %self.kind, records = snapshot.records.len(), url = %self.url, "fetched map");
        Ok(snapshot)
    }

    fn fetch_since(&self, since: DateTime<Utc>) -> Result<ChangeSet, SourceError> {
        let response = self.get(Some(since))?;
        if response.status() == 304 {
            tracing::debug!(map = %self.kind, url = %self.url, "not modified");
            return Ok(ChangeSet::empty());
        }
        // Servers that ignore If-Modified-Since still tell us via the header.
        match last_modified(&response) {
            Some(modified) if modified <= since => Ok(ChangeSet::empty()),
            _ => Err(SourceError::WatermarkTooOld {
                map: self.kind,
                since,
            }),
        }
    }
}

fn is_transient_status(code: u16) -> bool {
    matches!(code, 401 | 403 | 408 | 429) || code >= 500
}

fn last_modified(response: &ureq::Response) -> Option<DateTime<Utc>> {
    let raw = response.header("Last-Modified")?;
    match DateTime::parse_from_rfc2822(raw) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(e) => {
            tracing::warn!("ignoring unparseable Last-Modified '{raw}': {e}");
            None
        }
    }
}

/// IMF-fixdate, as HTTP conditional headers require.
pub(crate) fn http_date(ts: DateTime<Utc>) -> String {
    ts.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
