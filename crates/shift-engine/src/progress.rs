//! Progress accounting and operator-facing output.
//!
//! The remote-copy tool prints one line per file it handles. Progress is
//! therefore measured by counting newlines in its stdout, independently of
//! how the bytes were split into reads.

use std::io::Write;

/// Number of file completions represented by one stdout chunk: one per
/// newline, whatever the line says.
pub fn lines_completed(chunk: &[u8]) -> u64 {
    chunk.iter().filter(|&&b| b == b'\n').count() as u64
}

/// Which way files are moving relative to the local staging area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Get,
    Put,
}

/// Running counter for one transfer, sized from the manifest.
///
/// A get counts down from the manifest size to zero; a put counts up.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    direction: Direction,
    expected: u64,
    completed: u64,
}

impl TransferProgress {
    pub fn new(direction: Direction, expected: u64) -> Self {
        Self {
            direction,
            expected,
            completed: 0,
        }
    }

    /// Record a stdout chunk. Returns the completions it contained.
    pub fn record_chunk(&mut self, chunk: &[u8]) -> u64 {
        let k = lines_completed(chunk);
        self.completed += k;
        k
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    pub fn remaining(&self) -> u64 {
        self.expected.saturating_sub(self.completed)
    }

    pub fn status_line(&self) -> String {
        match self.direction {
            Direction::Get => format!("Files Remaining: {}", self.remaining()),
            Direction::Put => format!("Files Uploaded: {}/{}", self.completed, self.expected),
        }
    }

    pub fn done_line(&self) -> String {
        match self.direction {
            Direction::Get => "Files Remaining: Complete!".to_string(),
            Direction::Put => format!("Files Uploaded: {} Complete!", self.completed),
        }
    }
}

/// Splits a byte stream into lines across arbitrary chunk boundaries.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; `on_line` receives each completed line without its
    /// terminator (a trailing `\r` is stripped too).
    pub fn push(&mut self, chunk: &[u8], mut on_line: impl FnMut(&[u8])) {
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            if self.pending.is_empty() {
                on_line(trim_cr(head));
            } else {
                self.pending.extend_from_slice(head);
                on_line(trim_cr(&self.pending));
                self.pending.clear();
            }
            rest = &tail[1..];
        }
        self.pending.extend_from_slice(rest);
    }

    /// Flush an unterminated final line, if any.
    pub fn finish(&mut self, mut on_line: impl FnMut(&[u8])) {
        if !self.pending.is_empty() {
            on_line(trim_cr(&self.pending));
            self.pending.clear();
        }
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Where phase banners, the live status line and tool diagnostics go.
///
/// Kept apart from `tracing` so the status line can be overwritten in place.
pub trait Reporter: Send + Sync {
    /// A phase banner such as "Copying database tables".
    fn phase(&self, message: &str);
    /// Replace the current status line.
    fn status(&self, line: &str);
    /// Replace the status line one last time and move past it.
    fn finish_status(&self, line: &str);
    /// Live diagnostic output from a tool's stderr.
    fn diagnostic(&self, tool: &str, chunk: &[u8]);
}

/// Writes to the process's stderr.
#[derive(Debug, Default)]
pub struct TerminalReporter;

impl Reporter for TerminalReporter {
    fn phase(&self, message: &str) {
        eprintln!("{message}");
    }

    fn status(&self, line: &str) {
        let mut err = std::io::stderr().lock();
        let _ = write!(err, "\r\x1b[2K{line}");
        let _ = err.flush();
    }

    fn finish_status(&self, line: &str) {
        eprintln!("\r\x1b[2K{line}");
    }

    fn diagnostic(&self, tool: &str, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        let mut err = std::io::stderr().lock();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let _ = writeln!(err, "ERR {tool} > {line}");
        }
    }
}
