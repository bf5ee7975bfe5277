//! In-memory collaborators for tests.
//!
//! `MemoryCluster` holds one [`MemoryDatabase`] per environment and hands
//! out a connector and a table copier over them, so a whole tenant move can
//! run without MySQL or the hosting platform. `FakeRemote` does the same
//! for the remote file servers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use shift_core::{
    ConnectionInfo, DatabaseEndpoint, EnvironmentRef, FileEndpoint, RoutingRow, ShiftConfig,
    SqlIdent, SqlValue, TableSet, TenantId,
};
use tokio_util::sync::CancellationToken;

use crate::context::ShiftContext;
use crate::directory::{
    DatabaseConnector, EnvironmentDirectory, TableCopier, TenantDatabase, TenantInventory,
};
use crate::error::{ShiftError, ShiftResult};
use crate::progress::Reporter;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// `LIKE` matching with `%`, `_` and `\` escapes.
pub fn like_match(pattern: &str, s: &str) -> bool {
    fn go(p: &[char], s: &[char]) -> bool {
        match p.first() {
            None => s.is_empty(),
            Some('%') => (0..=s.len()).any(|i| go(&p[1..], &s[i..])),
            Some('_') => !s.is_empty() && go(&p[1..], &s[1..]),
            Some('\\') if p.len() > 1 => s.first() == Some(&p[1]) && go(&p[2..], &s[1..]),
            Some(c) => s.first() == Some(c) && go(&p[1..], &s[1..]),
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = s.chars().collect();
    go(&p, &s)
}

// ── Environment directory ──────────────────────────────────────────

/// Answers every lookup with synthetic connection details.
#[derive(Default)]
pub struct MemoryDirectory {
    wakes: Mutex<HashMap<String, usize>>,
    lookups: Mutex<HashMap<String, usize>>,
    failing_wakes: Mutex<HashSet<String>>,
    sites: Mutex<HashMap<(String, String), Vec<String>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake_count(&self, env: &EnvironmentRef) -> usize {
        lock(&self.wakes).get(&env.to_string()).copied().unwrap_or(0)
    }

    pub fn lookup_count(&self, env: &EnvironmentRef) -> usize {
        lock(&self.lookups).get(&env.to_string()).copied().unwrap_or(0)
    }

    pub fn fail_wakes(&self, env: &EnvironmentRef) {
        lock(&self.failing_wakes).insert(env.to_string());
    }

    pub fn set_sites(&self, upstream: &str, stage: &str, sites: &[&str]) {
        lock(&self.sites).insert(
            (upstream.to_string(), stage.to_string()),
            sites.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn info_for(env: &EnvironmentRef) -> ConnectionInfo {
        let uuid = format!("uuid-{}", env.site());
        ConnectionInfo {
            env: env.clone(),
            uuid: uuid.clone(),
            database: DatabaseEndpoint {
                host: format!("db.{}", env),
                port: 3306,
                database: "pantheon".to_string(),
                username: "pantheon".to_string(),
                password: "secret".to_string(),
            },
            files: FileEndpoint {
                user: format!("{}.{uuid}", env.stage()),
                host: format!("appserver.{}.{uuid}.example", env.stage()),
                port: 2222,
            },
        }
    }
}

#[async_trait]
impl EnvironmentDirectory for MemoryDirectory {
    async fn connection_info(&self, env: &EnvironmentRef) -> ShiftResult<ConnectionInfo> {
        *lock(&self.lookups).entry(env.to_string()).or_default() += 1;
        Ok(Self::info_for(env))
    }

    async fn wake(&self, env: &EnvironmentRef) -> ShiftResult<()> {
        *lock(&self.wakes).entry(env.to_string()).or_default() += 1;
        if lock(&self.failing_wakes).contains(&env.to_string()) {
            return Err(ShiftError::Transport {
                tool: "terminus".to_string(),
                code: 1,
                stderr: format!("could not wake {env}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TenantInventory for MemoryDirectory {
    async fn list_sites(&self, upstream: &str, stage: &str) -> ShiftResult<Vec<String>> {
        Ok(lock(&self.sites)
            .get(&(upstream.to_string(), stage.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

// ── Databases ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
    pub auto_increment: u64,
}

/// A schema of tables. The first column of a table is its primary key.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    env: String,
    tables: Mutex<BTreeMap<String, MemoryTable>>,
    failing: Mutex<bool>,
}

impl MemoryDatabase {
    pub fn new(env: &str) -> Self {
        Self {
            env: env.to_string(),
            ..Default::default()
        }
    }

    pub fn create_table(&self, name: &str, columns: &[&str]) {
        lock(&self.tables).insert(
            name.to_string(),
            MemoryTable {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows: Vec::new(),
                auto_increment: 1,
            },
        );
    }

    /// Append a row of text values; `None` is SQL NULL.
    pub fn insert(&self, table: &str, values: &[Option<&str>]) {
        let mut tables = lock(&self.tables);
        let t = tables
            .get_mut(table)
            .unwrap_or_else(|| panic!("no table {table}"));
        t.rows.push(
            values
                .iter()
                .map(|v| match v {
                    Some(s) => SqlValue::Text(s.to_string()),
                    None => SqlValue::Null,
                })
                .collect(),
        );
    }

    pub fn table_names(&self) -> Vec<String> {
        lock(&self.tables).keys().cloned().collect()
    }

    pub fn table(&self, name: &str) -> Option<MemoryTable> {
        lock(&self.tables).get(name).cloned()
    }

    pub fn row_count(&self, table: &str) -> usize {
        lock(&self.tables).get(table).map_or(0, |t| t.rows.len())
    }

    /// Make every query fail, as an unreachable server would.
    pub fn set_failing(&self, failing: bool) {
        *lock(&self.failing) = failing;
    }

    fn check(&self) -> ShiftResult<()> {
        if *lock(&self.failing) {
            return Err(ShiftError::Database {
                env: self.env.clone(),
                message: "server has gone away".to_string(),
            });
        }
        Ok(())
    }

    fn missing(&self, table: &SqlIdent) -> ShiftError {
        ShiftError::Database {
            env: self.env.clone(),
            message: format!("table '{table}' doesn't exist"),
        }
    }
}

#[async_trait]
impl TenantDatabase for MemoryDatabase {
    async fn tables_like(&self, pattern: &str) -> ShiftResult<Vec<String>> {
        self.check()?;
        Ok(lock(&self.tables)
            .keys()
            .filter(|name| like_match(pattern, name))
            .cloned()
            .collect())
    }

    async fn fetch_row(
        &self,
        table: &SqlIdent,
        key: &SqlIdent,
        tenant: &TenantId,
    ) -> ShiftResult<Option<RoutingRow>> {
        self.check()?;
        let tables = lock(&self.tables);
        let t = tables.get(table.as_str()).ok_or_else(|| self.missing(table))?;
        let idx = t
            .columns
            .iter()
            .position(|c| c == key.as_str())
            .ok_or_else(|| ShiftError::Database {
                env: self.env.clone(),
                message: format!("unknown column '{key}'"),
            })?;
        let want = SqlValue::Text(tenant.to_string());
        Ok(t.rows.iter().find(|r| r[idx] == want).map(|r| {
            RoutingRow::new(t.columns.iter().cloned().zip(r.iter().cloned()).collect())
        }))
    }

    async fn replace_row(&self, table: &SqlIdent, row: &RoutingRow) -> ShiftResult<()> {
        self.check()?;
        let mut tables = lock(&self.tables);
        let t = tables
            .get_mut(table.as_str())
            .ok_or_else(|| self.missing(table))?;
        let mut values = Vec::with_capacity(t.columns.len());
        for column in &t.columns {
            values.push(row.get(column).cloned().unwrap_or(SqlValue::Null));
        }
        t.rows.retain(|r| r[0] != values[0]);
        t.rows.push(values);
        Ok(())
    }

    async fn max_id(&self, table: &SqlIdent, column: &SqlIdent) -> ShiftResult<Option<u64>> {
        self.check()?;
        let tables = lock(&self.tables);
        let t = tables.get(table.as_str()).ok_or_else(|| self.missing(table))?;
        let idx = t
            .columns
            .iter()
            .position(|c| c == column.as_str())
            .ok_or_else(|| self.missing(column))?;
        Ok(t
            .rows
            .iter()
            .filter_map(|r| r[idx].as_text().and_then(|s| s.parse::<u64>().ok()))
            .max())
    }

    async fn set_auto_increment(&self, table: &SqlIdent, next: u64) -> ShiftResult<()> {
        self.check()?;
        let mut tables = lock(&self.tables);
        let t = tables
            .get_mut(table.as_str())
            .ok_or_else(|| self.missing(table))?;
        t.auto_increment = next;
        Ok(())
    }
}

/// One [`MemoryDatabase`] per environment.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    databases: Arc<Mutex<HashMap<String, Arc<MemoryDatabase>>>>,
    connects: Arc<AtomicUsize>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// The database of `env`, created empty on first use.
    pub fn database(&self, env: &EnvironmentRef) -> Arc<MemoryDatabase> {
        lock(&self.databases)
            .entry(env.to_string())
            .or_insert_with(|| Arc::new(MemoryDatabase::new(&env.to_string())))
            .clone()
    }

    fn existing(&self, env: &EnvironmentRef) -> ShiftResult<Arc<MemoryDatabase>> {
        lock(&self.databases)
            .get(&env.to_string())
            .cloned()
            .ok_or_else(|| ShiftError::Database {
                env: env.to_string(),
                message: "connection refused".to_string(),
            })
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector(self.clone())
    }

    pub fn copier(&self) -> MemoryTableCopier {
        MemoryTableCopier(self.clone())
    }
}

pub struct MemoryConnector(MemoryCluster);

#[async_trait]
impl DatabaseConnector for MemoryConnector {
    async fn connect(&self, info: &ConnectionInfo) -> ShiftResult<Arc<dyn TenantDatabase>> {
        let db = self.0.existing(&info.env)?;
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        Ok(db)
    }
}

/// Copies whole tables, replacing any same-named table at the destination,
/// as a dump-and-import would.
pub struct MemoryTableCopier(MemoryCluster);

#[async_trait]
impl TableCopier for MemoryTableCopier {
    async fn copy_tables(
        &self,
        source: &ConnectionInfo,
        dest: &ConnectionInfo,
        tables: &TableSet,
        cancel: &CancellationToken,
    ) -> ShiftResult<()> {
        if cancel.is_cancelled() {
            return Err(ShiftError::Cancelled("table copy".to_string()));
        }
        let src = self.0.existing(&source.env)?;
        let dst = self.0.existing(&dest.env)?;
        for name in tables.iter() {
            let table = src.table(name).ok_or_else(|| ShiftError::Transport {
                tool: "mysqldump".to_string(),
                code: 6,
                stderr: format!("Couldn't find table: \"{name}\""),
            })?;
            lock(&dst.tables).insert(name.to_string(), table);
        }
        Ok(())
    }
}

// ── Reporter ───────────────────────────────────────────────────────

/// Records everything it is told.
#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<String>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }
}

impl Reporter for RecordingReporter {
    fn phase(&self, message: &str) {
        lock(&self.events).push(format!("phase: {message}"));
    }

    fn status(&self, line: &str) {
        lock(&self.events).push(format!("status: {line}"));
    }

    fn finish_status(&self, line: &str) {
        lock(&self.events).push(format!("done: {line}"));
    }

    fn diagnostic(&self, tool: &str, chunk: &[u8]) {
        lock(&self.events).push(format!("{tool}: {}", String::from_utf8_lossy(chunk).trim_end()));
    }
}

// ── Remote file trees ──────────────────────────────────────────────

const FAKE_RSYNC: &str = r#"#!/bin/sh
# Stand-in for rsync over ssh. `user@host:path` maps to REMOTE/host/path.
REMOTE='@REMOTE@'
dry=0; del=0; list=''; src=''; dst=''
while [ $# -gt 0 ]; do
  case "$1" in
    -e) shift ;;
    --dry-run) dry=1 ;;
    --delete) del=1 ;;
    --files-from=*) list="${1#--files-from=}" ;;
    -*) ;;
    *) src="$dst"; dst="$1" ;;
  esac
  shift
done
map() {
  case "$1" in
    *@*:*) hp="${1#*@}"; echo "$REMOTE/${hp%%:*}/${hp#*:}" ;;
    *) echo "$1" ;;
  esac
}
src=$(map "$src"); dst=$(map "$dst")
if [ $del = 1 ]; then
  echo "sending incremental file list"
  if [ -d "$dst" ]; then
    (cd "$dst" && find . -mindepth 1 -depth | sed 's|^\./||') | while IFS= read -r p; do echo "deleting $p"; done
    find "$dst" -mindepth 1 -delete
  fi
  exit 0
fi
if [ ! -d "$src" ]; then
  echo "rsync: change_dir \"$src\" failed: No such file or directory (2)" >&2
  exit 23
fi
if [ $dry = 1 ]; then
  echo "receiving incremental file list"
  echo "./"
  (cd "$src" && find . -type f | sed 's|^\./||' | sort)
  echo ""
  echo "sent 20 bytes  received 100 bytes  240.00 bytes/sec"
  echo "total size is 42  speedup is 0.35 (DRY RUN)"
  exit 0
fi
mkdir -p "$dst"
while IFS= read -r p; do
  mkdir -p "$dst/$(dirname "$p")"
  cp "$src/$p" "$dst/$p" || exit 23
  echo "$p"
done < "$list"
"#;

const FAKE_SFTP: &str = r#"#!/bin/sh
# Stand-in for `sftp -b -`: applies -mkdir lines under REMOTE/host.
REMOTE='@REMOTE@'
for last; do :; done
host="${last#*@}"
while IFS= read -r line; do
  case "$line" in
    -mkdir\ *) mkdir -p "$REMOTE/$host/${line#-mkdir }" ;;
  esac
done
"#;

fn write_script(path: &Path, body: &str) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, body)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

/// Remote file servers simulated under a scratch directory, with `rsync`
/// and `sftp` stand-ins that resolve `user@host:path` against them.
pub struct FakeRemote {
    dir: tempfile::TempDir,
}

impl FakeRemote {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("scratch dir");
        let root = dir.path().join("remote");
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&root).expect("remote dir");
        std::fs::create_dir_all(&bin).expect("bin dir");
        let root = root.display().to_string();
        write_script(&bin.join("rsync"), &FAKE_RSYNC.replace("@REMOTE@", &root))
            .expect("rsync script");
        write_script(&bin.join("sftp"), &FAKE_SFTP.replace("@REMOTE@", &root))
            .expect("sftp script");
        Self { dir }
    }

    /// Directory holding `env`'s remote home.
    pub fn home(&self, env: &EnvironmentRef) -> PathBuf {
        let info = MemoryDirectory::info_for(env);
        self.dir.path().join("remote").join(info.files.host)
    }

    pub fn staging_root(&self) -> PathBuf {
        self.dir.path().join("staging")
    }

    pub fn write_file(&self, env: &EnvironmentRef, rel: &str, data: &[u8]) {
        let path = self.home(env).join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("parent dir");
        }
        std::fs::write(path, data).expect("write remote file");
    }

    pub fn read_file(&self, env: &EnvironmentRef, rel: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.home(env).join(rel))
    }

    /// Regular files below `rel`, recursively. Zero if it does not exist.
    pub fn file_count(&self, env: &EnvironmentRef, rel: &str) -> usize {
        fn walk(p: &Path) -> usize {
            let Ok(entries) = std::fs::read_dir(p) else {
                return 0;
            };
            entries
                .flatten()
                .map(|e| match e.file_type() {
                    Ok(t) if t.is_dir() => walk(&e.path()),
                    Ok(_) => 1,
                    Err(_) => 0,
                })
                .sum()
        }
        walk(&self.home(env).join(rel))
    }

    /// Config pointing the file tools and staging at this fake.
    pub fn config(&self) -> ShiftConfig {
        let mut config = ShiftConfig::default();
        let bin = self.dir.path().join("bin");
        config.tools.rsync = bin.join("rsync").display().to_string();
        config.tools.sftp = bin.join("sftp").display().to_string();
        config.staging.root = self.staging_root();
        config
    }

    /// A context over fresh in-memory collaborators.
    pub fn context(&self) -> (ShiftContext, Arc<RecordingReporter>) {
        self.context_with(&MemoryCluster::new(), Arc::new(MemoryDirectory::new()))
    }

    pub fn context_with(
        &self,
        cluster: &MemoryCluster,
        directory: Arc<MemoryDirectory>,
    ) -> (ShiftContext, Arc<RecordingReporter>) {
        let reporter = Arc::new(RecordingReporter::new());
        let ctx = ShiftContext::builder(self.config())
            .directory(directory.clone())
            .inventory(directory)
            .connector(Arc::new(cluster.connector()))
            .copier(Arc::new(cluster.copier()))
            .reporter(reporter.clone())
            .build()
            .expect("context");
        (ctx, reporter)
    }
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_match_semantics() {
        assert!(like_match(r"wp\_12\_%", "wp_12_posts"));
        assert!(!like_match(r"wp\_12\_%", "wp_123_posts"));
        // Unescaped underscores are wildcards.
        assert!(like_match("wp_12_%", "wp_123_posts"));
        assert!(like_match("a%c", "abbbc"));
        assert!(!like_match("a%c", "abbb"));
    }
}
