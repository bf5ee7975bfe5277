//! Child-process plumbing for the external transfer tools.
//!
//! Every tool runs in its own process group with piped output. Output is
//! handed to the caller chunk by chunk as it arrives, so long transfers can
//! drive a live display. A run ends in one of three ways:
//!
//! - the child exits: non-zero status becomes [`ShiftError::Transport`]
//!   carrying the tail of the tool's stderr
//! - the deadline passes: the whole process group is killed, `TimedOut`
//! - the cancellation token fires: the whole process group is killed,
//!   `Cancelled`
//!
//! Killing the group rather than the direct child matters for tools like
//! rsync that fork an ssh transport of their own.

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ShiftError, ShiftResult};

/// Bytes of stderr kept for error reports.
const STDERR_TAIL: usize = 4096;

const READ_BUF: usize = 8192;

/// Which output channel a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Deadline and cancellation applied to one external invocation.
#[derive(Debug, Clone)]
pub struct RunControl {
    pub deadline: Duration,
    pub cancel: CancellationToken,
}

impl RunControl {
    pub fn new(deadline: Duration, cancel: CancellationToken) -> Self {
        Self { deadline, cancel }
    }
}

/// A fully specified tool invocation. Arguments are passed as a list,
/// never through a shell.
#[derive(Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment; values are kept out of `Debug` output.
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    /// Short tool name for messages, e.g. `rsync`.
    pub fn tool(&self) -> String {
        std::path::Path::new(&self.program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.clone())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        cmd
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env_keys: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("CommandSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &env_keys)
            .finish()
    }
}

enum Outcome<T> {
    Finished(T),
    Cancelled,
    TimedOut,
}

/// Run a tool to completion, streaming its output into `on_output`.
///
/// Fails with `Transport` on non-zero exit.
pub async fn run<F>(spec: &CommandSpec, control: &RunControl, mut on_output: F) -> ShiftResult<()>
where
    F: FnMut(Stream, &[u8]),
{
    let tool = spec.tool();
    debug!(command = ?spec, "spawning");
    let mut child = spec.command().spawn().map_err(|e| spawn_error(&tool, e))?;
    let pid = child.id();

    let stdin_data = spec.stdin.clone();
    let mut stdin = child.stdin.take();
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut tail = Vec::new();

    let drive = async {
        let feed = async {
            if let (Some(pipe), Some(data)) = (stdin.as_mut(), stdin_data) {
                // The tool may exit without reading everything.
                if let Err(e) = pipe.write_all(&data).await {
                    debug!(%tool, error = %e, "stdin closed early");
                }
            }
            drop(stdin.take());
        };
        let read = async {
            let mut out_buf = vec![0u8; READ_BUF];
            let mut err_buf = vec![0u8; READ_BUF];
            let mut out_open = stdout.is_some();
            let mut err_open = stderr.is_some();
            while out_open || err_open {
                tokio::select! {
                    r = read_some(&mut stdout, &mut out_buf), if out_open => {
                        match r? {
                            0 => out_open = false,
                            n => on_output(Stream::Stdout, &out_buf[..n]),
                        }
                    }
                    r = read_some(&mut stderr, &mut err_buf), if err_open => {
                        match r? {
                            0 => err_open = false,
                            n => {
                                push_tail(&mut tail, &err_buf[..n]);
                                on_output(Stream::Stderr, &err_buf[..n]);
                            }
                        }
                    }
                }
            }
            Ok::<_, std::io::Error>(())
        };
        let ((), read_result) = tokio::join!(feed, read);
        read_result?;
        child.wait().await
    };

    let outcome = tokio::select! {
        status = drive => Outcome::Finished(status),
        _ = control.cancel.cancelled() => Outcome::Cancelled,
        _ = tokio::time::sleep(control.deadline) => Outcome::TimedOut,
    };

    match outcome {
        Outcome::Finished(status) => check_status(&tool, status?, &tail),
        Outcome::Cancelled => {
            terminate(&mut child, pid, &tool).await;
            Err(ShiftError::Cancelled(tool))
        }
        Outcome::TimedOut => {
            terminate(&mut child, pid, &tool).await;
            Err(ShiftError::TimedOut {
                tool,
                after: control.deadline,
            })
        }
    }
}

/// Run a tool and return everything it wrote to stdout.
pub async fn capture(spec: &CommandSpec, control: &RunControl) -> ShiftResult<Vec<u8>> {
    let mut out = Vec::new();
    run(spec, control, |stream, chunk| {
        if stream == Stream::Stdout {
            out.extend_from_slice(chunk);
        }
    })
    .await?;
    Ok(out)
}

/// Run `producer | consumer` with the pipe wired directly between the two
/// children, so memory use is bounded by the pipe buffer.
///
/// Both children must exit zero. The producer's failure is reported first
/// since a consumer error is usually its consequence, unless the producer
/// only died of a broken pipe left by a consumer that failed.
pub async fn pipe(
    producer: &CommandSpec,
    consumer: &CommandSpec,
    control: &RunControl,
) -> ShiftResult<()> {
    let producer_tool = producer.tool();
    let consumer_tool = consumer.tool();
    debug!(producer = ?producer, consumer = ?consumer, "spawning pipeline");

    let mut first = producer
        .command()
        .spawn()
        .map_err(|e| spawn_error(&producer_tool, e))?;
    let first_pid = first.id();
    let link: Stdio = first
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("producer stdout not captured"))?
        .try_into()?;

    let mut second_cmd = consumer.command();
    second_cmd.stdin(link);
    let spawned = second_cmd.spawn();
    // The command still holds the read end of the pipe; a producer only
    // sees a broken pipe once the consumer is its last reader.
    drop(second_cmd);
    let mut second = match spawned {
        Ok(child) => child,
        Err(e) => {
            terminate(&mut first, first_pid, &producer_tool).await;
            return Err(spawn_error(&consumer_tool, e));
        }
    };
    let second_pid = second.id();

    let first_err = first.stderr.take();
    let second_out = second.stdout.take();
    let second_err = second.stderr.take();

    let drive = async {
        let (a, b, c) = tokio::join!(
            collect_tail(first_err),
            collect_tail(second_err),
            collect_tail(second_out),
        );
        let first_status = first.wait().await?;
        let second_status = second.wait().await?;
        Ok::<_, std::io::Error>((first_status, second_status, a?, b?, c?))
    };

    let outcome = tokio::select! {
        r = drive => Outcome::Finished(r),
        _ = control.cancel.cancelled() => Outcome::Cancelled,
        _ = tokio::time::sleep(control.deadline) => Outcome::TimedOut,
    };

    match outcome {
        Outcome::Finished(r) => {
            let (first_status, second_status, first_tail, second_tail, _) = r?;
            if !second_status.success() && broken_pipe(first_status) {
                check_status(&consumer_tool, second_status, &second_tail)?;
            }
            check_status(&producer_tool, first_status, &first_tail)?;
            check_status(&consumer_tool, second_status, &second_tail)
        }
        Outcome::Cancelled => {
            terminate(&mut first, first_pid, &producer_tool).await;
            terminate(&mut second, second_pid, &consumer_tool).await;
            Err(ShiftError::Cancelled(format!("{producer_tool} | {consumer_tool}")))
        }
        Outcome::TimedOut => {
            terminate(&mut first, first_pid, &producer_tool).await;
            terminate(&mut second, second_pid, &consumer_tool).await;
            Err(ShiftError::TimedOut {
                tool: format!("{producer_tool} | {consumer_tool}"),
                after: control.deadline,
            })
        }
    }
}

async fn read_some<R: AsyncRead + Unpin>(
    reader: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match reader.as_mut() {
        Some(r) => r.read(buf).await,
        None => Ok(0),
    }
}

async fn collect_tail<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut tail = Vec::new();
    let Some(mut reader) = reader else {
        return Ok(tail);
    };
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(tail);
        }
        push_tail(&mut tail, &buf[..n]);
    }
}

fn push_tail(tail: &mut Vec<u8>, chunk: &[u8]) {
    tail.extend_from_slice(chunk);
    if tail.len() > STDERR_TAIL {
        let excess = tail.len() - STDERR_TAIL;
        tail.drain(..excess);
    }
}

fn check_status(tool: &str, status: ExitStatus, stderr_tail: &[u8]) -> ShiftResult<()> {
    if status.success() {
        debug!(%tool, "exited cleanly");
        return Ok(());
    }
    let code = status.code().unwrap_or(-1);
    let stderr = String::from_utf8_lossy(stderr_tail).trim().to_string();
    warn!(%tool, code, "tool failed");
    Err(ShiftError::Transport {
        tool: tool.to_string(),
        code,
        stderr,
    })
}

/// Killed by SIGPIPE, directly or as a shell's `128 + signal` status.
fn broken_pipe(status: ExitStatus) -> bool {
    let sigpipe = Signal::SIGPIPE as i32;
    status.signal() == Some(sigpipe) || status.code() == Some(128 + sigpipe)
}

fn spawn_error(tool: &str, e: std::io::Error) -> ShiftError {
    ShiftError::Transport {
        tool: tool.to_string(),
        code: -1,
        stderr: format!("failed to execute {tool}: {e}"),
    }
}

/// Kill the child's whole process group and reap it.
async fn terminate(child: &mut Child, pid: Option<u32>, tool: &str) {
    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            debug!(%tool, pid, error = %e, "killpg failed");
        }
    }
    let _ = child.kill().await;
    warn!(%tool, "process group terminated");
}
