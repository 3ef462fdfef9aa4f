//! `nsscache verify`: report drift between caches and sources.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use nsscache_core::MapKind;
use nsscache_update::verify::{verify_map, VerifyReport, DEFAULT_SAMPLE};

use crate::Globals;

/// Arguments for `nsscache verify`.
#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Map to verify; repeat for several. Defaults to every configured map.
    #[arg(long = "map", value_name = "KIND")]
    pub maps: Vec<MapKind>,

    /// Keys sampled in each direction.
    #[arg(long, default_value_t = DEFAULT_SAMPLE)]
    pub sample: usize,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct VerifyRow {
    #[tabled(rename = "map")]
    map: String,
    #[tabled(rename = "result")]
    result: String,
    #[tabled(rename = "cache")]
    cache: String,
    #[tabled(rename = "source")]
    source: String,
    #[tabled(rename = "problems")]
    problems: String,
}

/// One map's verdict; a map that could not be checked is reported, not fatal.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum VerifyOutcome {
    Checked(VerifyReport),
    Failed { map: MapKind, error: String },
}

impl VerifyOutcome {
    fn is_consistent(&self) -> bool {
        matches!(self, VerifyOutcome::Checked(report) if report.is_consistent())
    }
}

impl VerifyArgs {
    /// Exit 0 when every map is consistent, 1 otherwise.
    pub fn run(self, globals: &Globals) -> Result<u8> {
        let config = globals.load_config()?;
        let mut outcomes = Vec::new();
        for kind in config.select(&self.maps)? {
            let options = config
                .map(kind)
                .with_context(|| format!("map '{kind}' is not configured"))?;
            let outcome = match verify_map(&config, options, self.sample) {
                Ok(report) => VerifyOutcome::Checked(report),
                Err(err) => {
                    tracing::error!(map = %kind, "verify failed: {err}");
                    VerifyOutcome::Failed {
                        map: kind,
                        error: err.to_string(),
                    }
                }
            };
            outcomes.push(outcome);
        }

        let consistent = outcomes.iter().all(VerifyOutcome::is_consistent);
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&outcomes)
                    .context("failed to serialize verify JSON")?
            );
        } else {
            print_table(&outcomes);
        }
        Ok(if consistent { 0 } else { 1 })
    }
}

fn print_table(outcomes: &[VerifyOutcome]) {
    let rows: Vec<VerifyRow> = outcomes
        .iter()
        .map(|outcome| match outcome {
            VerifyOutcome::Checked(r) => VerifyRow {
                map: r.map.to_string(),
                result: if r.is_consistent() {
                    "ok".green().to_string()
                } else {
                    "drift".red().bold().to_string()
                },
                cache: r
                    .cache_records
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "missing".to_string()),
                source: r.source_records.to_string(),
                problems: problems(r),
            },
            VerifyOutcome::Failed { map, error } => VerifyRow {
                map: map.to_string(),
                result: "error".red().bold().to_string(),
                cache: "-".to_string(),
                source: "-".to_string(),
                problems: error.clone(),
            },
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn problems(report: &VerifyReport) -> String {
    let mut out = Vec::new();
    let mut list = |label: &str, keys: &[String]| {
        if !keys.is_empty() {
            out.push(format!("{label}: {}", summarize(keys)));
        }
    };
    list("not in cache", &report.missing_in_cache);
    list("differs", &report.differing);
    list("not in source", &report.missing_in_source);
    out.extend(report.index_problems.iter().cloned());
    if out.is_empty() {
        return "-".to_string();
    }
    out.join("\n")
}

fn summarize(keys: &[String]) -> String {
    let mut names: Vec<String> = keys.iter().take(3).cloned().collect();
    if keys.len() > names.len() {
        names.push(format!("+{} more", keys.len() - names.len()));
    }
    names.join(", ")
}
