use std::sync::Arc;

use anyhow::bail;
use shift_core::{EnvironmentRef, ShiftConfig, TenantId};
use shift_engine::{MoveOptions, MoveReport, ShiftResult, move_many};
use tokio_util::sync::CancellationToken;

use crate::OutputFormat;

#[allow(clippy::too_many_arguments)]
pub async fn run(
    config: ShiftConfig,
    cancel: CancellationToken,
    source: EnvironmentRef,
    dest: EnvironmentRef,
    tenants: Vec<TenantId>,
    opts: MoveOptions,
    jobs: Option<usize>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let jobs = jobs.unwrap_or(config.batch.max_parallel);
    let ctx = Arc::new(super::context(config, cancel)?);
    let results = move_many(ctx, source, dest, tenants, opts, jobs).await;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&to_json(&results))?),
        OutputFormat::Text => {
            for (tenant, result) in &results {
                match result {
                    Ok(report) => println!(
                        "✓ tenant {tenant}: {} tables{}",
                        report.tables.len(),
                        report
                            .files
                            .as_ref()
                            .map(|[_, put]| format!(", {} files", put.completed))
                            .unwrap_or_default()
                    ),
                    Err(e) => println!("✗ tenant {tenant}: {e}"),
                }
            }
        }
    }

    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
    if failed > 0 {
        bail!("{failed} of {} tenant moves failed", results.len());
    }
    Ok(())
}

fn to_json(results: &[(TenantId, ShiftResult<MoveReport>)]) -> serde_json::Value {
    results
        .iter()
        .map(|(tenant, result)| match result {
            Ok(report) => serde_json::json!({ "tenant": tenant, "ok": true, "report": report }),
            Err(e) => serde_json::json!({ "tenant": tenant, "ok": false, "error": e.to_string() }),
        })
        .collect()
}
