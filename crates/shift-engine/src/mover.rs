//! The tenant move pipeline and the bounded batch mover.
//!
//! One move runs discover → copy tables → routing row → files, strictly in
//! that order. Everything that can refuse the move (no tables, no routing
//! row, tenant already at the destination) is checked before the first
//! write to the destination. Nothing is rolled back on failure; every
//! step is safe to re-run.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use shift_core::{EnvironmentRef, TenantId};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::context::ShiftContext;
use crate::error::{ShiftError, ShiftResult};
use crate::sync::{ManifestFileSync, SyncReport};
use crate::tables::TableTransferEngine;

#[derive(Debug, Clone, Copy, Default)]
pub struct MoveOptions {
    /// Overwrite tables the destination already holds for the tenant.
    pub force: bool,
    /// Move the database only.
    pub skip_files: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MoveReport {
    pub tenant: TenantId,
    pub source: EnvironmentRef,
    pub dest: EnvironmentRef,
    pub tables: Vec<String>,
    pub files: Option<[SyncReport; 2]>,
}

pub struct TenantMover<'a> {
    ctx: &'a ShiftContext,
}

impl<'a> TenantMover<'a> {
    pub fn new(ctx: &'a ShiftContext) -> Self {
        Self { ctx }
    }

    pub async fn move_tenant(
        &self,
        source: &EnvironmentRef,
        dest: &EnvironmentRef,
        tenant: &TenantId,
        opts: MoveOptions,
    ) -> ShiftResult<MoveReport> {
        if source == dest {
            return Err(ShiftError::Precondition(format!(
                "source and destination are both {source}"
            )));
        }
        let reporter = &self.ctx.reporter;
        reporter.phase(&format!("Moving tenant {tenant} from {source} to {dest}"));

        self.ctx.wake.ensure_awake(source).await;
        self.ctx.wake.ensure_awake(dest).await;

        let engine = TableTransferEngine::new(self.ctx);
        let tables = engine.discover_tables(source, tenant).await?;
        if tables.is_empty() {
            return Err(ShiftError::Precondition(format!(
                "no tables for tenant {tenant} at {source}"
            )));
        }
        engine.fetch_routing_row(source, tenant).await?;
        if !opts.force && engine.destination_has_tenant(dest, tenant).await? {
            return Err(ShiftError::Precondition(format!(
                "{dest} already has tables for tenant {tenant}; pass --force to overwrite"
            )));
        }

        engine.transfer_tables(source, dest, &tables).await?;
        reporter.phase("Copying routing row");
        engine.transfer_routing_row(source, dest, tenant).await?;

        let files = if opts.skip_files {
            None
        } else {
            let (got, put) = ManifestFileSync::new(self.ctx)
                .sync(source, dest, tenant)
                .await?;
            Some([got, put])
        };

        info!(%source, %dest, %tenant, tables = tables.len(), "tenant moved");
        reporter.phase(&format!("Tenant {tenant} moved"));
        Ok(MoveReport {
            tenant: tenant.clone(),
            source: source.clone(),
            dest: dest.clone(),
            tables: tables.names().to_vec(),
            files,
        })
    }
}

/// Move several tenants with at most `jobs` pipelines in flight.
///
/// Results come back in input order. A failed tenant does not stop the
/// others; cancellation does, through the shared token.
pub async fn move_many(
    ctx: Arc<ShiftContext>,
    source: EnvironmentRef,
    dest: EnvironmentRef,
    tenants: Vec<TenantId>,
    opts: MoveOptions,
    jobs: usize,
) -> Vec<(TenantId, ShiftResult<MoveReport>)> {
    let mut seen = HashSet::new();
    let tenants: Vec<TenantId> = tenants
        .into_iter()
        .filter(|t| {
            let fresh = seen.insert(t.clone());
            if !fresh {
                warn!(tenant = %t, "duplicate tenant ignored");
            }
            fresh
        })
        .collect();

    let permits = Arc::new(Semaphore::new(jobs.max(1)));
    let mut set = JoinSet::new();
    for (idx, tenant) in tenants.iter().cloned().enumerate() {
        let ctx = ctx.clone();
        let permits = permits.clone();
        let (source, dest) = (source.clone(), dest.clone());
        set.spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => {
                    TenantMover::new(&ctx)
                        .move_tenant(&source, &dest, &tenant, opts)
                        .await
                }
                Err(_) => Err(ShiftError::Cancelled(format!("move of {tenant}"))),
            };
            (idx, result)
        });
    }

    let mut results: Vec<Option<ShiftResult<MoveReport>>> =
        tenants.iter().map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((idx, result)) => {
                if let Err(e) = &result {
                    error!(tenant = %tenants[idx], error = %e, "tenant move failed");
                }
                results[idx] = Some(result);
            }
            Err(e) => error!(error = %e, "move task panicked"),
        }
    }

    tenants
        .into_iter()
        .zip(results)
        .map(|(tenant, result)| {
            let result = result.unwrap_or_else(|| {
                Err(ShiftError::Cancelled(format!("move of {tenant}")))
            });
            (tenant, result)
        })
        .collect()
}
