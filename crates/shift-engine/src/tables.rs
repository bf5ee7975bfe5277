//! Tenant table discovery, bulk copy, and routing-row migration.
//!
//! Order within a move is fixed: discover the tenant's tables at the
//! source, copy exactly those tables, then write the routing row. The
//! routing row is only meaningful once its tables exist at the
//! destination, and it is written with replace semantics so a re-run
//! after a partial failure leaves one row, not two.

use async_trait::async_trait;
use shift_core::config::DatabaseConfig;
use shift_core::{ConnectionInfo, EnvironmentRef, RoutingRow, SqlIdent, TableSet, TenantId};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::ShiftContext;
use crate::directory::TableCopier;
use crate::error::{ShiftError, ShiftResult};
use crate::process::{self, CommandSpec, RunControl};

pub struct TableTransferEngine<'a> {
    ctx: &'a ShiftContext,
}

impl<'a> TableTransferEngine<'a> {
    pub fn new(ctx: &'a ShiftContext) -> Self {
        Self { ctx }
    }

    fn db_config(&self) -> &DatabaseConfig {
        &self.ctx.config.database
    }

    /// The tenant's tables at `source`, in catalog order.
    pub async fn discover_tables(
        &self,
        source: &EnvironmentRef,
        tenant: &TenantId,
    ) -> ShiftResult<TableSet> {
        let prefix = &self.db_config().table_prefix;
        let db = self.ctx.registry.get(source).await?;
        let pattern = tenant.like_pattern(prefix);
        let names = db.tables_like(&pattern).await?;

        let (owned, foreign): (Vec<String>, Vec<String>) = names
            .into_iter()
            .partition(|name| tenant.owns_table(prefix, name));
        if !foreign.is_empty() {
            warn!(%source, %tenant, ?foreign, "catalog returned tables of another tenant; ignored");
        }
        for name in &owned {
            SqlIdent::parse(name)?;
        }
        info!(%source, %tenant, count = owned.len(), "tables discovered");
        Ok(TableSet::new(owned))
    }

    /// Copy `tables` from `source` to `dest`.
    pub async fn transfer_tables(
        &self,
        source: &EnvironmentRef,
        dest: &EnvironmentRef,
        tables: &TableSet,
    ) -> ShiftResult<()> {
        if tables.is_empty() {
            return Err(ShiftError::Precondition(
                "refusing to transfer an empty table set".to_string(),
            ));
        }
        let source_info = self.ctx.directory.connection_info(source).await?;
        let dest_info = self.ctx.directory.connection_info(dest).await?;
        self.ctx.reporter.phase("Copying database tables");
        self.ctx
            .copier
            .copy_tables(&source_info, &dest_info, tables, &self.ctx.cancel)
            .await?;
        info!(%source, %dest, count = tables.len(), "tables copied");
        Ok(())
    }

    /// The tenant's routing row at `source`. Missing is a precondition
    /// failure: a tenant without a directory entry cannot be moved.
    pub async fn fetch_routing_row(
        &self,
        source: &EnvironmentRef,
        tenant: &TenantId,
    ) -> ShiftResult<RoutingRow> {
        let table = self.db_config().routing_table_ident()?;
        let key = self.db_config().routing_key_ident()?;
        let db = self.ctx.registry.get(source).await?;
        db.fetch_row(&table, &key, tenant).await?.ok_or_else(|| {
            ShiftError::Precondition(format!(
                "tenant {tenant} has no row in {table} at {source}"
            ))
        })
    }

    /// Copy the tenant's routing row, replacing any row with the same key.
    pub async fn transfer_routing_row(
        &self,
        source: &EnvironmentRef,
        dest: &EnvironmentRef,
        tenant: &TenantId,
    ) -> ShiftResult<RoutingRow> {
        let row = self.fetch_routing_row(source, tenant).await?;
        let table = self.db_config().routing_table_ident()?;
        for column in row.column_names() {
            SqlIdent::parse(column)?;
        }
        let db = self.ctx.registry.get(dest).await?;
        db.replace_row(&table, &row).await?;
        info!(%source, %dest, %tenant, %table, "routing row migrated");
        Ok(row)
    }

    /// Whether `dest` already holds tables for the tenant.
    pub async fn destination_has_tenant(
        &self,
        dest: &EnvironmentRef,
        tenant: &TenantId,
    ) -> ShiftResult<bool> {
        Ok(!self.discover_tables(dest, tenant).await?.is_empty())
    }
}

/// Streams `mysqldump` of the selected tables straight into `mysql`.
pub struct DumpImportCopier {
    dump_program: String,
    import_program: String,
    deadline: std::time::Duration,
}

impl DumpImportCopier {
    pub fn new(dump_program: &str, import_program: &str, deadline: std::time::Duration) -> Self {
        Self {
            dump_program: dump_program.to_string(),
            import_program: import_program.to_string(),
            deadline,
        }
    }

    /// Dump scoped to exactly `tables`, never the whole schema.
    ///
    /// Column statistics are left out so a newer client can dump for an
    /// older server.
    pub fn dump_command(&self, source: &ConnectionInfo, tables: &TableSet) -> CommandSpec {
        let db = &source.database;
        CommandSpec::new(&self.dump_program)
            .args([
                "--column-statistics=0".to_string(),
                "--single-transaction".to_string(),
                "--quick".to_string(),
                format!("--host={}", db.host),
                format!("--port={}", db.port),
                format!("--user={}", db.username),
                db.database.clone(),
            ])
            .args(tables.iter())
            .env("MYSQL_PWD", &db.password)
    }

    /// Import into the destination schema. `-A` skips table-name
    /// completion, which is slow on large multisite schemas.
    pub fn import_command(&self, dest: &ConnectionInfo) -> CommandSpec {
        let db = &dest.database;
        CommandSpec::new(&self.import_program)
            .args([
                "-A".to_string(),
                format!("--host={}", db.host),
                format!("--port={}", db.port),
                format!("--user={}", db.username),
                db.database.clone(),
            ])
            .env("MYSQL_PWD", &db.password)
    }
}

#[async_trait]
impl TableCopier for DumpImportCopier {
    async fn copy_tables(
        &self,
        source: &ConnectionInfo,
        dest: &ConnectionInfo,
        tables: &TableSet,
        cancel: &CancellationToken,
    ) -> ShiftResult<()> {
        let dump = self.dump_command(source, tables);
        let import = self.import_command(dest);
        process::pipe(&dump, &import, &RunControl::new(self.deadline, cancel.clone())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryDirectory;
    use std::time::Duration;

    fn tables(names: &[&str]) -> TableSet {
        TableSet::new(names.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn dump_is_scoped_to_table_set() {
        let copier = DumpImportCopier::new("mysqldump", "mysql", Duration::from_secs(1));
        let source = MemoryDirectory::info_for(&EnvironmentRef::parse("src.live").unwrap());
        let spec = copier.dump_command(&source, &tables(&["wp_5_options", "wp_5_posts"]));

        assert_eq!(spec.program, "mysqldump");
        assert!(spec.args.contains(&"--column-statistics=0".to_string()));
        let db_pos = spec.args.iter().position(|a| a == "pantheon").unwrap();
        assert_eq!(&spec.args[db_pos + 1..], ["wp_5_options", "wp_5_posts"]);
        assert!(!spec.args.iter().any(|a| a.contains("secret")));
        assert_eq!(spec.env, vec![("MYSQL_PWD".to_string(), "secret".to_string())]);
    }

    #[test]
    fn import_targets_destination() {
        let copier = DumpImportCopier::new("mysqldump", "mysql", Duration::from_secs(1));
        let dest = MemoryDirectory::info_for(&EnvironmentRef::parse("dst.live").unwrap());
        let spec = copier.import_command(&dest);
        assert_eq!(spec.args[0], "-A");
        assert!(spec.args.contains(&"--host=db.dst.live".to_string()));
        assert_eq!(spec.args.last().unwrap(), "pantheon");
    }

    #[tokio::test]
    async fn copier_pipes_dump_into_import() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("import.sql");
        let dump = dir.path().join("dump.sh");
        let import = dir.path().join("import.sh");
        std::fs::write(&dump, "#!/bin/sh\nfor t in \"$@\"; do echo \"-- $t\"; done\n").unwrap();
        std::fs::write(&import, format!("#!/bin/sh\ncat > {}\n", out.display())).unwrap();
        use std::os::unix::fs::PermissionsExt;
        for p in [&dump, &import] {
            std::fs::set_permissions(p, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let copier = DumpImportCopier::new(
            dump.to_str().unwrap(),
            import.to_str().unwrap(),
            Duration::from_secs(10),
        );
        let src = MemoryDirectory::info_for(&EnvironmentRef::parse("src.live").unwrap());
        let dst = MemoryDirectory::info_for(&EnvironmentRef::parse("dst.live").unwrap());
        copier
            .copy_tables(&src, &dst, &tables(&["wp_5_posts"]), &CancellationToken::new())
            .await
            .unwrap();

        let sql = std::fs::read_to_string(&out).unwrap();
        assert!(sql.ends_with("-- pantheon\n-- wp_5_posts\n"));
    }
}
