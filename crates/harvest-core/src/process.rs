//! Subprocess execution for pipeline steps.
//!
//! Every step that leaves the process (git, the interpreter, the installer,
//! the crawl script) goes through [`run`]. Stdout and stderr are drained
//! line by line in background tasks so a chatty child never blocks on a full
//! pipe; lines are collected for error reporting and, when requested, echoed
//! through `tracing` and appended to the run log.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{HarvestError, Result};

/// Longest stderr excerpt carried inside an error.
const STDERR_HINT_CHARS: usize = 800;

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    /// Append every output line to this file.
    pub log_path: Option<PathBuf>,
    /// Echo output lines at `info` level instead of `debug`.
    pub echo: bool,
}

impl CommandSpec {
    pub fn new(argv: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            argv,
            cwd: cwd.into(),
            env: Vec::new(),
            timeout: None,
            log_path: None,
            echo: false,
        }
    }

    pub fn env(mut self, vars: &[(String, String)]) -> Self {
        self.env.extend(vars.iter().cloned());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn log_to(mut self, path: Option<PathBuf>) -> Self {
        self.log_path = path;
        self
    }

    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Turn a non-zero exit into [`HarvestError::CommandFailed`].
    pub fn check(self, command: &str) -> Result<Self> {
        if self.status.success() {
            return Ok(self);
        }
        Err(HarvestError::CommandFailed {
            command: command.to_string(),
            status: self.status.to_string(),
            stderr: stderr_hint(&self.stderr),
        })
    }
}

#[derive(Debug)]
pub enum Completion {
    Exited(CommandOutput),
    TimedOut { after: Duration },
}

/// Spawn `spec` and wait for it to exit or time out.
pub async fn run(spec: &CommandSpec) -> Result<Completion> {
    let Some((program, args)) = spec.argv.split_first() else {
        return Err(HarvestError::SpawnFailed {
            program: String::new(),
            reason: "empty command".into(),
        });
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }

    debug!(command = %spec.display(), cwd = %spec.cwd.display(), "spawning");
    let start = Instant::now();

    let mut child = cmd.spawn().map_err(|e| HarvestError::SpawnFailed {
        program: program.clone(),
        reason: e.to_string(),
    })?;

    let stdout = child.stdout.take().ok_or_else(|| HarvestError::SpawnFailed {
        program: program.clone(),
        reason: "stdout not captured".into(),
    })?;
    let stderr = child.stderr.take().ok_or_else(|| HarvestError::SpawnFailed {
        program: program.clone(),
        reason: "stderr not captured".into(),
    })?;

    let out_task = drain(stdout, "stdout", spec.echo, spec.log_path.clone());
    let err_task = drain(stderr, "stderr", spec.echo, spec.log_path.clone());

    let status = match spec.timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(command = %spec.display(), timeout_secs = limit.as_secs(), "killing timed-out command");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill child");
                }
                out_task.abort();
                err_task.abort();
                return Ok(Completion::TimedOut { after: limit });
            }
        },
        None => child.wait().await?,
    };

    let stdout = out_task.await.unwrap_or_default();
    let stderr = err_task.await.unwrap_or_default();
    let duration_ms = start.elapsed().as_millis() as u64;

    debug!(command = %spec.display(), %status, duration_ms, "command exited");

    Ok(Completion::Exited(CommandOutput {
        status,
        stdout,
        stderr,
        duration_ms,
    }))
}

/// Run `spec` and require a zero exit. A timeout is reported as a command
/// failure so retry loops treat it like any other transient error.
pub async fn run_checked(spec: &CommandSpec) -> Result<CommandOutput> {
    match run(spec).await? {
        Completion::Exited(out) => out.check(&spec.display()),
        Completion::TimedOut { after } => Err(HarvestError::CommandFailed {
            command: spec.display(),
            status: format!("timed out after {}s", after.as_secs()),
            stderr: String::new(),
        }),
    }
}

fn drain<R>(
    reader: R,
    stream: &'static str,
    echo: bool,
    log_path: Option<PathBuf>,
) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = String::new();
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if echo {
                info!(stream, "{line}");
            } else {
                debug!(stream, "{line}");
            }
            if let Some(path) = &log_path {
                if let Err(e) = crate::io::append_line(path, &format!("[{stream}] {line}")) {
                    warn!(error = %e, path = %path.display(), "failed to append run log");
                }
            }
            if !buf.is_empty() {
                buf.push('\n');
            }
            buf.push_str(&line);
        }
        buf
    })
}

fn stderr_hint(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.chars().count() <= STDERR_HINT_CHARS {
        return trimmed.to_string();
    }
    let tail: String = trimmed
        .chars()
        .rev()
        .take(STDERR_HINT_CHARS)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("...{tail}")
}
