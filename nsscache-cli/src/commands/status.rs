//! `nsscache status`: cache freshness per map.

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use serde_json::Value;
use tabled::{settings::Style, Table, Tabled};
use tera::{Context, Tera};

use nsscache_core::MapKind;
use nsscache_update::status::{format_age, status};
use nsscache_update::{CheckError, Freshness, MapCheck, MapStatus};

use crate::Globals;

/// Arguments for `nsscache status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Map to report; repeat for several. Defaults to every configured map.
    #[arg(long = "map", value_name = "KIND")]
    pub maps: Vec<MapKind>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,

    /// Print timestamps as seconds since the epoch.
    #[arg(long)]
    pub epoch: bool,

    /// Render each map through a Tera template, e.g.
    /// `'{{ map }} {{ last_update }}'`.
    #[arg(long, value_name = "TERA", conflicts_with = "json")]
    pub template: Option<String>,
}

impl StatusArgs {
    /// Exit 1 when any map's status could not be read.
    pub fn run(self, globals: &Globals) -> Result<u8> {
        let config = globals.load_config()?;
        let checks = status(&config, &self.maps).context("status check failed")?;
        let code = if checks.iter().any(|c| c.result.is_err()) { 1 } else { 0 };
        let rows: Vec<StatusJson> = checks
            .iter()
            .map(|c| match &c.result {
                Ok(s) => StatusJson::new(s, self.epoch),
                Err(err) => StatusJson::failed(c.map, err),
            })
            .collect();

        if let Some(template) = &self.template {
            for row in &rows {
                println!("{}", render_template(template, row)?);
            }
            return Ok(code);
        }
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&rows).context("failed to serialize status JSON")?
            );
            return Ok(code);
        }

        print_table(&checks);
        Ok(code)
    }
}

/// One map's status as exposed to JSON and templates.
#[derive(Debug, Serialize)]
struct StatusJson {
    map: String,
    cache_path: Option<String>,
    last_full_update: Option<Value>,
    last_incremental_update: Option<Value>,
    last_update: Option<Value>,
    source_marker: Option<Value>,
    records: Option<usize>,
    freshness: &'static str,
    detail: String,
}

impl StatusJson {
    fn new(status: &MapStatus, epoch: bool) -> Self {
        let ts = |t: Option<DateTime<Utc>>| {
            t.map(|t| {
                if epoch {
                    Value::from(t.timestamp())
                } else {
                    Value::from(t.to_rfc3339())
                }
            })
        };
        Self {
            map: status.map.to_string(),
            cache_path: Some(status.cache_path.display().to_string()),
            last_full_update: ts(status.last_full_update),
            last_incremental_update: ts(status.last_incremental_update),
            last_update: ts(status.last_update),
            source_marker: ts(status.source_marker),
            records: status.records,
            freshness: freshness_key(&status.freshness),
            detail: freshness_detail(&status.freshness),
        }
    }

    fn failed(map: MapKind, err: &CheckError) -> Self {
        Self {
            map: map.to_string(),
            cache_path: None,
            last_full_update: None,
            last_incremental_update: None,
            last_update: None,
            source_marker: None,
            records: None,
            freshness: "error",
            detail: err.to_string(),
        }
    }
}

fn render_template(template: &str, row: &StatusJson) -> Result<String> {
    let context = Context::from_serialize(row).context("failed to build template context")?;
    Tera::one_off(template, &context, false)
        .with_context(|| format!("failed to render template for '{}'", row.map))
}

#[derive(Tabled)]
struct StatusTableRow {
    #[tabled(rename = "map")]
    map: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "detail")]
    detail: String,
    #[tabled(rename = "last update")]
    last_update: String,
    #[tabled(rename = "last full")]
    last_full: String,
    #[tabled(rename = "records")]
    records: String,
}

fn print_table(checks: &[MapCheck]) {
    let attention = checks
        .iter()
        .filter(|c| !matches!(&c.result, Ok(s) if s.freshness == Freshness::Current))
        .count();
    println!(
        "nsscache v{} | {} maps | {} need attention",
        env!("CARGO_PKG_VERSION"),
        checks.len(),
        attention,
    );
    if checks.is_empty() {
        println!("No maps configured.");
        return;
    }

    let age = |t: Option<DateTime<Utc>>| t.map(format_age).unwrap_or_else(|| "never".to_string());
    let rows: Vec<StatusTableRow> = checks
        .iter()
        .map(|c| match &c.result {
            Ok(s) => StatusTableRow {
                map: s.map.to_string(),
                status: format!("{} {}", indicator(&s.freshness), label(&s.freshness)),
                detail: freshness_detail(&s.freshness),
                last_update: age(s.last_update),
                last_full: age(s.last_full_update),
                records: s
                    .records
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            },
            Err(err) => StatusTableRow {
                map: c.map.to_string(),
                status: format!("{} ERROR", "■".red().bold()),
                detail: err.to_string(),
                last_update: "-".to_string(),
                last_full: "-".to_string(),
                records: "-".to_string(),
            },
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    if attention > 0 {
        println!("Run 'nsscache update' (or 'nsscache repair' for modified caches).");
    }
}

fn freshness_key(freshness: &Freshness) -> &'static str {
    match freshness {
        Freshness::NeverUpdated => "never_updated",
        Freshness::Current => "current",
        Freshness::Stale { .. } => "stale",
        Freshness::Missing => "missing",
        Freshness::Modified => "modified",
    }
}

fn label(freshness: &Freshness) -> &'static str {
    match freshness {
        Freshness::NeverUpdated => "NEVER UPDATED",
        Freshness::Current => "CURRENT",
        Freshness::Stale { .. } => "STALE",
        Freshness::Missing => "MISSING",
        Freshness::Modified => "MODIFIED",
    }
}

fn indicator(freshness: &Freshness) -> String {
    match freshness {
        Freshness::NeverUpdated => "■".bright_black().bold().to_string(),
        Freshness::Current => "■".green().bold().to_string(),
        Freshness::Stale { .. } => "■".yellow().bold().to_string(),
        Freshness::Missing => "■".magenta().bold().to_string(),
        Freshness::Modified => "■".red().bold().to_string(),
    }
}

fn freshness_detail(freshness: &Freshness) -> String {
    match freshness {
        Freshness::NeverUpdated => "no watermark".to_string(),
        Freshness::Current => "up to date".to_string(),
        Freshness::Stale { reason } => reason.clone(),
        Freshness::Missing => "cache file is gone".to_string(),
        Freshness::Modified => "edited outside nsscache".to_string(),
    }
}
