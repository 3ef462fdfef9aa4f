pub mod diff;
pub mod repair;
pub mod status;
pub mod update;
pub mod verify;

use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use nsscache_update::RunSummary;

#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "map")]
    map: String,
    #[tabled(rename = "result")]
    result: String,
    #[tabled(rename = "mode")]
    mode: String,
    #[tabled(rename = "records")]
    records: String,
    #[tabled(rename = "detail")]
    detail: String,
}

/// Print one row per map and return the process exit code.
pub(crate) fn report_summary(summary: &RunSummary) -> u8 {
    let rows: Vec<OutcomeRow> = summary
        .results
        .iter()
        .map(|r| match &r.result {
            Ok(report) => OutcomeRow {
                map: r.map.to_string(),
                result: format!("{:?}", report.outcome).to_lowercase().green().to_string(),
                mode: report.mode.to_string(),
                records: report.records.to_string(),
                detail: match &report.reason {
                    Some(reason) => format!("{} changes; {reason}", report.changes),
                    None => format!("{} changes", report.changes),
                },
            },
            Err(err) if err.is_lock_busy() => OutcomeRow {
                map: r.map.to_string(),
                result: "busy".yellow().to_string(),
                mode: "-".to_string(),
                records: "-".to_string(),
                detail: err.cause.to_string(),
            },
            Err(err) => OutcomeRow {
                map: r.map.to_string(),
                result: "failed".red().bold().to_string(),
                mode: err.stage.to_string(),
                records: "-".to_string(),
                detail: format!("{}: {}", err.kind(), err.cause),
            },
        })
        .collect();

    if !rows.is_empty() {
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
    }

    let status = summary.exit_status();
    tracing::info!(
        succeeded = summary.succeeded(),
        failed = summary.failed(),
        busy = summary.busy(),
        "run finished ({status:?})"
    );
    status.code()
}
