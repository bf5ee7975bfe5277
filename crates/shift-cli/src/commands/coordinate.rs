use std::path::PathBuf;

use shift_core::ShiftConfig;
use anyhow::bail;
use shift_engine::{CoordinationPlanner, CoordinationReport, ProbeStatus};
use shift_state::LedgerStore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::OutputFormat;

#[allow(clippy::too_many_arguments)]
pub async fn run(
    config: ShiftConfig,
    cancel: CancellationToken,
    upstream: &str,
    stage: &str,
    table: &str,
    column: &str,
    apply: bool,
    ledger: Option<PathBuf>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let ledger_path = ledger.unwrap_or_else(|| config.coordination.ledger.clone());
    let ledger = LedgerStore::open(&ledger_path)?;
    info!(ledger = %ledger_path.display(), "ledger opened");

    let ctx = super::context(config, cancel)?;
    let report = CoordinationPlanner::new(&ctx, &ledger)
        .run(upstream, stage, table, column, apply)
        .await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print!("{}", report.render_text()),
    }

    check(&report)
}

/// Non-zero exit when any site could not be probed or has outgrown its range.
fn check(report: &CoordinationReport) -> anyhow::Result<()> {
    let failed = report.count(ProbeStatus::Failed);
    let exhausted = report.count(ProbeStatus::Exhausted);
    if failed + exhausted > 0 {
        bail!(
            "{failed} of {} sites failed, {exhausted} already past their range",
            report.sites.len()
        );
    }
    Ok(())
}
