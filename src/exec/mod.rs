//! FX-010: Process execution through bash with cwd, env, and a timeout.
//!
//! The interpreter never spawns processes directly; it goes through a
//! [`CommandRunner`] supplied by the driver. [`LocalShell`] is the default.

pub mod local;

use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Output from running a command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr, as captured for build failures.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// A shell instruction plus where and how long to run it.
#[derive(Debug, Clone)]
pub struct CommandRequest<'a> {
    pub script: &'a str,
    pub cwd: Option<&'a Path>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl<'a> CommandRequest<'a> {
    pub fn new(script: &'a str) -> Self {
        Self {
            script,
            cwd: None,
            env: Vec::new(),
            timeout: None,
        }
    }

    pub fn cwd(mut self, dir: &'a Path) -> Self {
        self.cwd = Some(dir);
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn timeout(mut self, limit: Option<Duration>) -> Self {
        self.timeout = limit;
        self
    }
}

/// Process execution failures (a non-zero exit is not one of these).
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn bash: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("process I/O error: {0}")]
    Io(#[source] std::io::Error),

    #[error("timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
}

/// Shell/process execution capability.
pub trait CommandRunner: Sync {
    fn run(&self, request: &CommandRequest<'_>) -> Result<ExecOutput, ExecError>;
}

/// Runs commands on this machine via `bash`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalShell;

impl CommandRunner for LocalShell {
    fn run(&self, request: &CommandRequest<'_>) -> Result<ExecOutput, ExecError> {
        local::exec_local(request)
    }
}

/// A wall-clock bound shared by the steps of one stage.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    pub fn after(limit: Option<Duration>) -> Self {
        Self {
            start: Instant::now(),
            limit,
        }
    }

    pub fn limit(&self) -> Option<Duration> {
        self.limit
    }

    pub fn expired(&self) -> bool {
        self.limit.is_some_and(|l| self.start.elapsed() >= l)
    }

    /// Time left, for handing to a child process. `None` = unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.limit
            .map(|l| l.saturating_sub(self.start.elapsed()).max(Duration::from_millis(1)))
    }
}
