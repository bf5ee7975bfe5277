//! Identifier-range coordination across every site of one upstream.
//!
//! Each site gets a fixed-size block of row identifiers for the target
//! table, recorded in the ledger so re-running never moves a block. With
//! `apply`, the site's `AUTO_INCREMENT` is raised into its block; rows
//! created afterwards cannot collide with rows of any other site, so a
//! tenant can later be moved between sites freely.

use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use shift_core::{EnvironmentRef, SqlIdent};
use shift_state::{AllocationScope, IdRange, LedgerStore, RangeAllocation};
use tracing::{info, warn};

use crate::context::ShiftContext;
use crate::error::{ShiftError, ShiftResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    /// Probed; nothing written.
    Planned,
    /// `AUTO_INCREMENT` raised into the block.
    Applied,
    /// Existing identifiers already run past the end of the block.
    Exhausted,
    /// The site could not be probed.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SitePlan {
    pub site: String,
    pub block: u64,
    pub range: IdRange,
    pub max_id: Option<u64>,
    /// First identifier new rows will receive, once applied.
    pub next_id: Option<u64>,
    pub status: ProbeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinationReport {
    pub upstream: String,
    pub stage: String,
    pub table: String,
    pub column: String,
    pub block_size: u64,
    pub applied: bool,
    pub sites: Vec<SitePlan>,
}

impl CoordinationReport {
    pub fn count(&self, status: ProbeStatus) -> usize {
        self.sites.iter().filter(|s| s.status == status).count()
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} ({}) {}.{}: {} sites, block size {}",
            self.upstream,
            self.stage,
            self.table,
            self.column,
            self.sites.len(),
            self.block_size
        );
        for s in &self.sites {
            let max = s.max_id.map_or_else(|| "-".to_string(), |m| m.to_string());
            let next = s.next_id.map_or_else(|| "-".to_string(), |n| n.to_string());
            let _ = write!(
                out,
                "  {:<32} {:>12}..{:<12} max {:>10} next {:>10} {:?}",
                s.site, s.range.start, s.range.end, max, next, s.status
            );
            if let Some(e) = &s.error {
                let _ = write!(out, " ({e})");
            }
            out.push('\n');
        }
        out
    }
}

/// Next auto-increment value for a site: the start of its block, or past
/// its current maximum if that is already inside the block.
pub fn next_auto_increment(range: &IdRange, max_id: Option<u64>) -> u64 {
    match max_id {
        Some(max) => range.start.max(max.saturating_add(1)),
        None => range.start,
    }
}

pub struct CoordinationPlanner<'a> {
    ctx: &'a ShiftContext,
    ledger: &'a LedgerStore,
}

impl<'a> CoordinationPlanner<'a> {
    pub fn new(ctx: &'a ShiftContext, ledger: &'a LedgerStore) -> Self {
        Self { ctx, ledger }
    }

    /// Allocate blocks for every site of `upstream` on `stage` and probe
    /// each site's current maximum of `table.column`. A site that fails to
    /// answer is reported and skipped; the rest continue.
    pub async fn run(
        &self,
        upstream: &str,
        stage: &str,
        table: &str,
        column: &str,
        apply: bool,
    ) -> ShiftResult<CoordinationReport> {
        let table_ident = SqlIdent::parse(table)?;
        let column_ident = SqlIdent::parse(column)?;
        let coordination = &self.ctx.config.coordination;

        let sites = self.ctx.inventory.list_sites(upstream, stage).await?;
        let scope = AllocationScope::new(upstream, stage, table);
        let allocations = self.ledger.allocate(
            &scope,
            &sites,
            coordination.block_size,
            coordination.reserved_blocks,
            unix_now(),
        )?;
        info!(%upstream, %stage, %table, sites = sites.len(), apply, "coordinating identifier ranges");

        let mut plans = Vec::with_capacity(allocations.len());
        for alloc in allocations {
            if self.ctx.cancel.is_cancelled() {
                return Err(ShiftError::Cancelled("coordination".to_string()));
            }
            let plan = match self
                .probe(&scope, stage, &alloc, &table_ident, &column_ident, apply)
                .await
            {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(site = %alloc.site, error = %e, "site probe failed; continuing");
                    SitePlan {
                        site: alloc.site.clone(),
                        block: alloc.block,
                        range: alloc.range,
                        max_id: None,
                        next_id: None,
                        status: ProbeStatus::Failed,
                        error: Some(e.to_string()),
                    }
                }
            };
            self.ctx.reporter.status(&format!(
                "Probed {}/{}: {}",
                plans.len() + 1,
                sites.len(),
                plan.site
            ));
            plans.push(plan);
        }
        self.ctx
            .reporter
            .finish_status(&format!("Probed {} sites", plans.len()));

        Ok(CoordinationReport {
            upstream: upstream.to_string(),
            stage: stage.to_string(),
            table: table.to_string(),
            column: column.to_string(),
            block_size: coordination.block_size,
            applied: apply,
            sites: plans,
        })
    }

    async fn probe(
        &self,
        scope: &AllocationScope,
        stage: &str,
        alloc: &RangeAllocation,
        table: &SqlIdent,
        column: &SqlIdent,
        apply: bool,
    ) -> ShiftResult<SitePlan> {
        let env = EnvironmentRef::new(&alloc.site, stage)?;
        self.ctx.wake.ensure_awake(&env).await;
        let db = self.ctx.registry.get(&env).await?;
        let max_id = db.max_id(table, column).await?;
        let next = next_auto_increment(&alloc.range, max_id);

        let mut plan = SitePlan {
            site: alloc.site.clone(),
            block: alloc.block,
            range: alloc.range,
            max_id,
            next_id: Some(next),
            status: ProbeStatus::Planned,
            error: None,
        };
        if next > alloc.range.end {
            warn!(%env, max_id, end = alloc.range.end, "identifiers already past the block");
            plan.next_id = None;
            plan.status = ProbeStatus::Exhausted;
            return Ok(plan);
        }
        if apply {
            db.set_auto_increment(table, next).await?;
            self.ledger.mark_applied(scope, &alloc.site, next)?;
            info!(%env, %table, next, "auto-increment applied");
            plan.status = ProbeStatus::Applied;
        }
        Ok(plan)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRemote, MemoryCluster, MemoryDirectory};
    use std::sync::Arc;

    struct Fixture {
        _remote: FakeRemote,
        ctx: ShiftContext,
        cluster: MemoryCluster,
        directory: Arc<MemoryDirectory>,
        ledger: LedgerStore,
    }

    fn fixture(sites: &[&str]) -> Fixture {
        let remote = FakeRemote::new();
        let cluster = MemoryCluster::new();
        let directory = Arc::new(MemoryDirectory::new());
        directory.set_sites("up-1", "live", sites);
        for site in sites {
            let db = cluster.database(&EnvironmentRef::new(site, "live").unwrap());
            db.create_table("wp_posts", &["ID", "post_title"]);
        }
        let (ctx, _) = remote.context_with(&cluster, directory.clone());
        Fixture {
            _remote: remote,
            ctx,
            cluster,
            directory,
            ledger: LedgerStore::open_in_memory().unwrap(),
        }
    }

    fn env(site: &str) -> EnvironmentRef {
        EnvironmentRef::new(site, "live").unwrap()
    }

    #[test]
    fn next_value_policy() {
        let r = IdRange::block(2, 100).unwrap();
        assert_eq!(next_auto_increment(&r, None), 201);
        assert_eq!(next_auto_increment(&r, Some(17)), 201);
        assert_eq!(next_auto_increment(&r, Some(250)), 251);
        assert_eq!(next_auto_increment(&r, Some(300)), 301);
    }

    #[tokio::test]
    async fn plan_assigns_blocks_in_inventory_order() {
        let f = fixture(&["alpha", "beta"]);
        f.cluster.database(&env("alpha")).insert("wp_posts", &[Some("42"), Some("hi")]);

        let planner = CoordinationPlanner::new(&f.ctx, &f.ledger);
        let report = planner.run("up-1", "live", "wp_posts", "ID", false).await.unwrap();

        assert_eq!(report.sites.len(), 2);
        let alpha = &report.sites[0];
        assert_eq!(alpha.site, "alpha");
        assert_eq!(alpha.range, IdRange { start: 100_001, end: 200_000 });
        assert_eq!(alpha.max_id, Some(42));
        assert_eq!(alpha.next_id, Some(100_001));
        assert_eq!(alpha.status, ProbeStatus::Planned);
        assert_eq!(report.sites[1].range.start, 200_001);
        assert_eq!(report.sites[1].max_id, None);

        // Plan only: nothing written.
        let table = f.cluster.database(&env("alpha")).table("wp_posts").unwrap();
        assert_eq!(table.auto_increment, 1);
        assert_eq!(f.directory.wake_count(&env("alpha")), 1);
    }

    #[tokio::test]
    async fn apply_sets_auto_increment_and_records_it() {
        let f = fixture(&["alpha"]);
        let planner = CoordinationPlanner::new(&f.ctx, &f.ledger);
        let report = planner.run("up-1", "live", "wp_posts", "ID", true).await.unwrap();
        assert_eq!(report.count(ProbeStatus::Applied), 1);

        let table = f.cluster.database(&env("alpha")).table("wp_posts").unwrap();
        assert_eq!(table.auto_increment, 100_001);
        let scope = AllocationScope::new("up-1", "live", "wp_posts");
        let alloc = f.ledger.get_allocation(&scope, "alpha").unwrap().unwrap();
        assert_eq!(alloc.applied_auto_increment, Some(100_001));
    }

    #[tokio::test]
    async fn rerun_keeps_ranges_and_appends_new_sites() {
        let f = fixture(&["alpha", "beta"]);
        let planner = CoordinationPlanner::new(&f.ctx, &f.ledger);
        let first = planner.run("up-1", "live", "wp_posts", "ID", false).await.unwrap();

        f.directory.set_sites("up-1", "live", &["gamma", "beta", "alpha"]);
        f.cluster
            .database(&env("gamma"))
            .create_table("wp_posts", &["ID", "post_title"]);
        let second = planner.run("up-1", "live", "wp_posts", "ID", false).await.unwrap();

        let range_of = |r: &CoordinationReport, site: &str| {
            r.sites.iter().find(|s| s.site == site).unwrap().range
        };
        assert_eq!(range_of(&first, "alpha"), range_of(&second, "alpha"));
        assert_eq!(range_of(&first, "beta"), range_of(&second, "beta"));
        assert_eq!(range_of(&second, "gamma").start, 300_001);
    }

    #[tokio::test]
    async fn failing_site_is_reported_and_others_continue() {
        let f = fixture(&["alpha", "beta", "gamma"]);
        f.cluster.database(&env("beta")).set_failing(true);

        let planner = CoordinationPlanner::new(&f.ctx, &f.ledger);
        let report = planner.run("up-1", "live", "wp_posts", "ID", true).await.unwrap();
        assert_eq!(report.sites[1].status, ProbeStatus::Failed);
        assert!(report.sites[1].error.as_deref().unwrap().contains("gone away"));
        assert_eq!(report.count(ProbeStatus::Applied), 2);
    }

    #[tokio::test]
    async fn ids_past_block_are_exhausted_not_applied() {
        let f = fixture(&["alpha"]);
        f.cluster
            .database(&env("alpha"))
            .insert("wp_posts", &[Some("250000"), Some("big")]);
        let planner = CoordinationPlanner::new(&f.ctx, &f.ledger);
        let report = planner.run("up-1", "live", "wp_posts", "ID", true).await.unwrap();
        assert_eq!(report.sites[0].status, ProbeStatus::Exhausted);
        let table = f.cluster.database(&env("alpha")).table("wp_posts").unwrap();
        assert_eq!(table.auto_increment, 1);
    }

    #[tokio::test]
    async fn text_report_lists_every_site() {
        let f = fixture(&["alpha", "beta"]);
        let planner = CoordinationPlanner::new(&f.ctx, &f.ledger);
        let report = planner.run("up-1", "live", "wp_posts", "ID", false).await.unwrap();
        let text = report.render_text();
        assert!(text.starts_with("up-1 (live) wp_posts.ID: 2 sites"));
        assert_eq!(text.lines().count(), 3);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["sites"][0]["status"], "planned");
    }
}
