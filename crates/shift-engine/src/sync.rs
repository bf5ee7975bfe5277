//! Manifest-driven file sync between a tenant's remote directory and local
//! staging.
//!
//! Each direction runs `Enumerating → Counting → Transferring → Done`:
//! a dry-run writes the list of in-scope paths to a manifest, the manifest
//! is counted, and the real transfer is restricted to the manifest with
//! `--files-from`. A failed tool run moves the direction to `Failed` and
//! nothing after it runs. Partial transfers are left in place; a re-run
//! skips files whose checksum already matches.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use shift_core::{ConnectionInfo, EnvironmentRef, TenantId};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::context::ShiftContext;
use crate::error::{ShiftError, ShiftResult};
use crate::process::{self, CommandSpec, RunControl, Stream};
use crate::progress::{Direction, LineSplitter, TransferProgress, lines_completed};

/// Where one direction of a sync stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Enumerating,
    Counting,
    Transferring,
    Done,
    Failed,
}

impl SyncPhase {
    pub fn can_advance_to(self, next: SyncPhase) -> bool {
        use SyncPhase::*;
        matches!(
            (self, next),
            (Idle, Enumerating)
                | (Enumerating, Counting)
                | (Counting, Transferring)
                | (Transferring, Done)
                | (Enumerating | Counting | Transferring, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SyncPhase::Done | SyncPhase::Failed)
    }
}

#[derive(Debug)]
struct PhaseTracker {
    direction: Direction,
    phase: SyncPhase,
}

impl PhaseTracker {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            phase: SyncPhase::Idle,
        }
    }

    fn advance(&mut self, next: SyncPhase) -> ShiftResult<()> {
        if !self.phase.can_advance_to(next) {
            return Err(ShiftError::Phase {
                from: self.phase,
                to: next,
            });
        }
        debug!(direction = ?self.direction, from = ?self.phase, to = ?next, "sync phase");
        self.phase = next;
        Ok(())
    }

    /// Record a failure and hand the error back.
    fn fail(&mut self, err: ShiftError) -> ShiftError {
        if self.phase.can_advance_to(SyncPhase::Failed) {
            self.phase = SyncPhase::Failed;
        }
        warn!(direction = ?self.direction, error = %err, "sync failed");
        err
    }
}

/// Outcome of one direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub direction: Direction,
    pub manifest: PathBuf,
    pub expected: u64,
    pub completed: u64,
    pub phase: SyncPhase,
}

/// Summary lines rsync prints around the file list.
static CHATTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?:receiving|sending) incremental file list|building file list.*|created directory .*|sent \d[\d,.]* bytes .*|total size is .*|\./)$",
    )
    .expect("static pattern")
});

/// Whether a line of rsync stdout names a path.
pub fn is_manifest_entry(line: &str) -> bool {
    !line.trim().is_empty() && !CHATTER.is_match(line)
}

/// Streams rsync stdout into the manifest file, one path per line.
struct ManifestWriter {
    out: BufWriter<File>,
    splitter: LineSplitter,
    entries: u64,
    error: Option<std::io::Error>,
}

impl ManifestWriter {
    fn create(path: &Path) -> ShiftResult<Self> {
        Ok(Self {
            out: BufWriter::new(File::create(path)?),
            splitter: LineSplitter::new(),
            entries: 0,
            error: None,
        })
    }

    fn write_line(
        out: &mut BufWriter<File>,
        entries: &mut u64,
        error: &mut Option<std::io::Error>,
        line: &[u8],
    ) {
        if error.is_some() || !is_manifest_entry(&String::from_utf8_lossy(line)) {
            return;
        }
        let res = out.write_all(line).and_then(|()| out.write_all(b"\n"));
        match res {
            Ok(()) => *entries += 1,
            Err(e) => *error = Some(e),
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let Self {
            out,
            splitter,
            entries,
            error,
        } = self;
        splitter.push(chunk, |line| Self::write_line(out, entries, error, line));
    }

    fn finish(mut self) -> ShiftResult<u64> {
        let Self {
            out,
            splitter,
            entries,
            error,
        } = &mut self;
        splitter.finish(|line| Self::write_line(out, entries, error, line));
        if let Some(e) = self.error.take() {
            return Err(e.into());
        }
        self.out.flush()?;
        Ok(self.entries)
    }
}

/// Count manifest lines without holding the file in memory.
pub async fn count_manifest(path: &Path) -> ShiftResult<u64> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0;
    let mut last = b'\n';
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        total += lines_completed(&buf[..n]);
        last = buf[n - 1];
    }
    // An unterminated final line still names a file.
    if last != b'\n' {
        total += 1;
    }
    Ok(total)
}

/// rsync options shared by enumeration and transfer: recursive, keep
/// symlinks but copy the targets of unsafe ones, compare by size and
/// checksum, IPv4 only, ssh on the platform port.
pub fn base_rsync_args(ssh_port: u16) -> Vec<String> {
    vec![
        "-rvlz".to_string(),
        "--copy-unsafe-links".to_string(),
        "--size-only".to_string(),
        "--checksum".to_string(),
        "--ipv4".to_string(),
        "-e".to_string(),
        format!("ssh -p {ssh_port}"),
    ]
}

pub fn enumerate_args(ssh_port: u16, src: &str, dst: &str) -> Vec<String> {
    let mut args = base_rsync_args(ssh_port);
    args.extend([src.to_string(), dst.to_string(), "--dry-run".to_string()]);
    args
}

pub fn transfer_args(ssh_port: u16, manifest: &Path, src: &str, dst: &str) -> Vec<String> {
    let mut args = base_rsync_args(ssh_port);
    args.extend([
        format!("--files-from={}", manifest.display()),
        src.to_string(),
        dst.to_string(),
    ]);
    args
}

/// Mirror an empty directory onto `remote` with `--delete`.
pub fn delete_args(ssh_port: u16, empty_dir: &Path, remote: &str) -> Vec<String> {
    vec![
        "-rLvz".to_string(),
        "--size-only".to_string(),
        "--checksum".to_string(),
        "--ipv4".to_string(),
        "-a".to_string(),
        "--delete".to_string(),
        "-e".to_string(),
        format!("ssh -p {ssh_port}"),
        format!("{}/", empty_dir.display()),
        remote.to_string(),
    ]
}

/// sftp batch creating every directory down to the tenant's. Each command
/// is `-` prefixed so an existing directory is not an error.
pub fn mkdir_batch(files_root: &str, tenant: &TenantId) -> String {
    let mut batch = String::new();
    let mut path = String::new();
    for part in files_root.split('/').filter(|p| !p.is_empty()) {
        if !path.is_empty() {
            path.push('/');
        }
        path.push_str(part);
        batch.push_str(&format!("-mkdir {path}\n"));
    }
    batch.push_str(&format!("-mkdir {path}/{tenant}\n"));
    batch
}

pub struct ManifestFileSync<'a> {
    ctx: &'a ShiftContext,
}

impl<'a> ManifestFileSync<'a> {
    pub fn new(ctx: &'a ShiftContext) -> Self {
        Self { ctx }
    }

    /// Local staging directory of a tenant.
    pub fn staging_dir(&self, tenant: &TenantId) -> PathBuf {
        self.ctx.config.staging.root.join(tenant.as_str())
    }

    pub fn manifest_path(&self, env: &EnvironmentRef, tenant: &TenantId) -> PathBuf {
        self.ctx
            .config
            .staging
            .root
            .join(format!("manifest.{env}.{tenant}.txt"))
    }

    /// `user@host:<files_root>/<tenant>/`
    pub fn remote_path(&self, info: &ConnectionInfo, tenant: &TenantId) -> String {
        let root = self.ctx.config.remote.files_root.trim_end_matches('/');
        format!("{}:{root}/{tenant}/", info.files.login())
    }

    fn rsync(&self, args: Vec<String>) -> CommandSpec {
        CommandSpec::new(&self.ctx.config.tools.rsync).args(args)
    }

    /// Download the tenant's remote files from `source` into staging.
    pub async fn get(&self, source: &EnvironmentRef, tenant: &TenantId) -> ShiftResult<SyncReport> {
        self.ctx.wake.ensure_awake(source).await;
        let info = self.ctx.directory.connection_info(source).await?;
        let staging = self.staging_dir(tenant);
        tokio::fs::create_dir_all(&staging).await?;

        self.ctx.reporter.phase("Downloading files from remote");
        self.run_direction(
            Direction::Get,
            info.files.port,
            &self.remote_path(&info, tenant),
            &staging.display().to_string(),
            self.manifest_path(source, tenant),
        )
        .await
    }

    /// Upload the tenant's staged files to `dest`.
    pub async fn put(&self, dest: &EnvironmentRef, tenant: &TenantId) -> ShiftResult<SyncReport> {
        let staging = self.staging_dir(tenant);
        if !tokio::fs::try_exists(&staging).await? {
            return Err(ShiftError::Precondition(format!(
                "no staged files for tenant {tenant} at {}; run a get first",
                staging.display()
            )));
        }
        self.ctx.wake.ensure_awake(dest).await;
        let info = self.ctx.directory.connection_info(dest).await?;
        self.prepare_remote(&info, tenant).await?;

        self.ctx.reporter.phase("Uploading files to remote");
        self.run_direction(
            Direction::Put,
            info.files.port,
            &format!("{}/", staging.display()),
            &self.remote_path(&info, tenant),
            self.manifest_path(dest, tenant),
        )
        .await
    }

    /// `get` from `source`, then `put` to `dest`.
    pub async fn sync(
        &self,
        source: &EnvironmentRef,
        dest: &EnvironmentRef,
        tenant: &TenantId,
    ) -> ShiftResult<(SyncReport, SyncReport)> {
        let got = self.get(source, tenant).await?;
        let put = self.put(dest, tenant).await?;
        Ok((got, put))
    }

    /// Remove every file under the tenant's remote directory on `env`.
    /// Returns the number of entries rsync reported deleting.
    pub async fn delete(&self, env: &EnvironmentRef, tenant: &TenantId) -> ShiftResult<u64> {
        self.ctx.wake.ensure_awake(env).await;
        let info = self.ctx.directory.connection_info(env).await?;
        let empty = tempfile::tempdir()?;
        let remote = self.remote_path(&info, tenant);

        warn!(%env, %tenant, %remote, "deleting remote tenant files");
        self.ctx.reporter.phase("Deleting remote files");
        let spec = self.rsync(delete_args(info.files.port, empty.path(), &remote));
        let tool = spec.tool();
        let mut splitter = LineSplitter::new();
        let mut deleted = 0u64;
        let reporter = self.ctx.reporter.clone();
        process::run(&spec, &self.control(self.ctx.timeouts.transfer), |stream, chunk| match stream {
            Stream::Stdout => splitter.push(chunk, |line| {
                if line.starts_with(b"deleting ") {
                    deleted += 1;
                }
            }),
            Stream::Stderr => reporter.diagnostic(&tool, chunk),
        })
        .await?;
        splitter.finish(|line| {
            if line.starts_with(b"deleting ") {
                deleted += 1;
            }
        });
        info!(%env, %tenant, deleted, "remote tenant files deleted");
        Ok(deleted)
    }

    fn control(&self, deadline: std::time::Duration) -> RunControl {
        RunControl::new(deadline, self.ctx.cancel.clone())
    }

    /// Create the remote tenant directory; rsync will not create parents.
    async fn prepare_remote(&self, info: &ConnectionInfo, tenant: &TenantId) -> ShiftResult<()> {
        let spec = CommandSpec::new(&self.ctx.config.tools.sftp)
            .args([
                "-b".to_string(),
                "-".to_string(),
                "-o".to_string(),
                format!("Port={}", info.files.port),
                info.files.login(),
            ])
            .stdin(mkdir_batch(&self.ctx.config.remote.files_root, tenant));
        process::capture(&spec, &self.control(self.ctx.timeouts.lookup)).await?;
        debug!(env = %info.env, %tenant, "remote directory prepared");
        Ok(())
    }

    async fn run_direction(
        &self,
        direction: Direction,
        ssh_port: u16,
        src: &str,
        dst: &str,
        manifest: PathBuf,
    ) -> ShiftResult<SyncReport> {
        let mut tracker = PhaseTracker::new(direction);

        tracker.advance(SyncPhase::Enumerating)?;
        let entries = self
            .enumerate(ssh_port, src, dst, &manifest)
            .await
            .map_err(|e| tracker.fail(e))?;
        debug!(manifest = %manifest.display(), entries, "manifest written");

        tracker.advance(SyncPhase::Counting)?;
        let expected = count_manifest(&manifest).await.map_err(|e| tracker.fail(e))?;
        info!(?direction, manifest = %manifest.display(), expected, "manifest counted");

        tracker.advance(SyncPhase::Transferring)?;
        let completed = if expected == 0 {
            self.ctx
                .reporter
                .finish_status(&TransferProgress::new(direction, 0).done_line());
            0
        } else {
            self.transfer(direction, ssh_port, src, dst, &manifest, expected)
                .await
                .map_err(|e| tracker.fail(e))?
        };

        tracker.advance(SyncPhase::Done)?;
        info!(?direction, expected, completed, "file sync complete");
        Ok(SyncReport {
            direction,
            manifest,
            expected,
            completed,
            phase: tracker.phase,
        })
    }

    async fn enumerate(
        &self,
        ssh_port: u16,
        src: &str,
        dst: &str,
        manifest: &Path,
    ) -> ShiftResult<u64> {
        let spec = self.rsync(enumerate_args(ssh_port, src, dst));
        let tool = spec.tool();
        let mut writer = ManifestWriter::create(manifest)?;
        let reporter = self.ctx.reporter.clone();
        process::run(&spec, &self.control(self.ctx.timeouts.enumerate), |stream, chunk| {
            match stream {
                Stream::Stdout => writer.push(chunk),
                Stream::Stderr => reporter.diagnostic(&tool, chunk),
            }
        })
        .await?;
        writer.finish()
    }

    async fn transfer(
        &self,
        direction: Direction,
        ssh_port: u16,
        src: &str,
        dst: &str,
        manifest: &Path,
        expected: u64,
    ) -> ShiftResult<u64> {
        let spec = self.rsync(transfer_args(ssh_port, manifest, src, dst));
        let tool = spec.tool();
        let mut progress = TransferProgress::new(direction, expected);
        let reporter = self.ctx.reporter.clone();
        process::run(&spec, &self.control(self.ctx.timeouts.transfer), |stream, chunk| {
            match stream {
                Stream::Stdout => {
                    if progress.record_chunk(chunk) > 0 {
                        reporter.status(&progress.status_line());
                    }
                }
                Stream::Stderr => reporter.diagnostic(&tool, chunk),
            }
        })
        .await?;
        reporter.finish_status(&progress.done_line());
        Ok(progress.completed())
    }
}
