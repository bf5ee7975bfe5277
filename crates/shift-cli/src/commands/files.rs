use anyhow::bail;
use shift_core::{EnvironmentRef, ShiftConfig, TenantId};
use shift_engine::{ManifestFileSync, SyncReport};
use tokio_util::sync::CancellationToken;

fn print_report(report: &SyncReport) {
    println!(
        "{:?}: {}/{} files, manifest {}",
        report.direction,
        report.completed,
        report.expected,
        report.manifest.display()
    );
}

pub async fn get(
    config: ShiftConfig,
    cancel: CancellationToken,
    env: &EnvironmentRef,
    tenant: &TenantId,
) -> anyhow::Result<()> {
    let ctx = super::context(config, cancel)?;
    let report = ManifestFileSync::new(&ctx).get(env, tenant).await?;
    print_report(&report);
    Ok(())
}

pub async fn put(
    config: ShiftConfig,
    cancel: CancellationToken,
    env: &EnvironmentRef,
    tenant: &TenantId,
) -> anyhow::Result<()> {
    let ctx = super::context(config, cancel)?;
    let report = ManifestFileSync::new(&ctx).put(env, tenant).await?;
    print_report(&report);
    Ok(())
}

pub async fn sync(
    config: ShiftConfig,
    cancel: CancellationToken,
    source: &EnvironmentRef,
    dest: &EnvironmentRef,
    tenant: &TenantId,
) -> anyhow::Result<()> {
    let ctx = super::context(config, cancel)?;
    let (got, put) = ManifestFileSync::new(&ctx).sync(source, dest, tenant).await?;
    print_report(&got);
    print_report(&put);
    Ok(())
}

pub async fn delete(
    config: ShiftConfig,
    cancel: CancellationToken,
    env: &EnvironmentRef,
    tenant: &TenantId,
    yes: bool,
) -> anyhow::Result<()> {
    if !yes {
        bail!("refusing to delete the files of tenant {tenant} on {env} without --yes");
    }
    let ctx = super::context(config, cancel)?;
    let deleted = ManifestFileSync::new(&ctx).delete(env, tenant).await?;
    println!("Deleted {deleted} entries for tenant {tenant} on {env}");
    Ok(())
}
