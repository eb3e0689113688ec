//! Managed subprocesses.
//!
//! Forwarders and tunnels are long-running external programs. Each one
//! is held behind a `ManagedProcess` handle that keeps the child, a
//! bounded buffer of its combined stdout/stderr, and explicit
//! `stop()` teardown. Dropping a handle does not kill the process;
//! whoever owns the record is responsible for stopping it.

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{ExposeError, ExposeResult};

/// Lines of output retained per process.
const MAX_OUTPUT_LINES: usize = 512;

/// How long `stop()` waits for the child to be reaped after the kill.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

const MATCH_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Program and arguments for a supervised process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Build a spec from an argument template, replacing `{key}`
    /// placeholders with the given values.
    pub fn from_template(program: &str, template: &[String], vars: &[(&str, String)]) -> Self {
        let args = template
            .iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |acc, (key, value)| {
                    acc.replace(&format!("{{{key}}}"), value)
                })
            })
            .collect::<Vec<_>>();
        Self::new(program).args(args)
    }

    /// `program arg1 arg2`, for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Handle to a supervised child process.
///
/// Cloning the handle shares the same child.
#[derive(Clone)]
pub struct ManagedProcess {
    spec: ProcessSpec,
    pid: Option<u32>,
    child: Arc<Mutex<Child>>,
    output: Arc<Mutex<VecDeque<String>>>,
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("command", &self.spec.command_line())
            .field("pid", &self.pid)
            .finish()
    }
}

impl ManagedProcess {
    /// Spawn the process with stdin closed and stdout/stderr captured.
    pub fn spawn(spec: ProcessSpec) -> ExposeResult<Self> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExposeError::CommandNotFound(spec.program.clone())
            } else {
                ExposeError::Spawn {
                    program: spec.program.clone(),
                    source: e,
                }
            }
        })?;

        let pid = child.id();
        let output = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(collect_lines(stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(collect_lines(stderr, output.clone()));
        }

        debug!(command = %spec.command_line(), ?pid, "spawned managed process");
        Ok(Self {
            spec,
            pid,
            child: Arc::new(Mutex::new(child)),
            output,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    /// Exit status if the process has already exited.
    pub async fn exit_status(&self) -> Option<ExitStatus> {
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                debug!(error = %e, pid = ?self.pid, "try_wait failed");
                None
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.exit_status().await.is_none()
    }

    /// Retained output lines, oldest first.
    pub async fn output(&self) -> Vec<String> {
        self.output.lock().await.iter().cloned().collect()
    }

    /// First match of `pattern` in the retained output, if any.
    pub async fn find_match(&self, pattern: &Regex) -> Option<String> {
        let output = self.output.lock().await;
        output
            .iter()
            .find_map(|line| pattern.find(line).map(|m| m.as_str().to_string()))
    }

    /// Wait up to `timeout` for `pattern` to appear in the output.
    ///
    /// Returns early with `None` once the process has exited and its
    /// output has no match.
    pub async fn wait_for_match(&self, pattern: &Regex, timeout: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(found) = self.find_match(pattern).await {
                return Some(found);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            if !self.is_running().await {
                // Give the readers a moment to drain what the process wrote.
                tokio::time::sleep(MATCH_POLL_INTERVAL).await;
                return self.find_match(pattern).await;
            }
            tokio::time::sleep(MATCH_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Kill the process and reap it. Stopping an exited process is a no-op.
    pub async fn stop(&self) -> ExposeResult<()> {
        let mut child = self.child.lock().await;
        if let Ok(Some(_)) = child.try_wait() {
            return Ok(());
        }
        if let Err(e) = child.start_kill() {
            // Raced with a natural exit.
            if e.kind() != std::io::ErrorKind::InvalidInput {
                return Err(ExposeError::Io(e));
            }
        }
        match tokio::time::timeout(STOP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid = ?self.pid, %status, "managed process stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(ExposeError::Io(e)),
            Err(_) => {
                warn!(pid = ?self.pid, "managed process did not exit after kill");
                Ok(())
            }
        }
    }
}

async fn collect_lines<R>(source: R, output: Arc<Mutex<VecDeque<String>>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(source).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let mut buf = output.lock().await;
                if buf.len() == MAX_OUTPUT_LINES {
                    buf.pop_front();
                }
                buf.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "stopped reading process output");
                break;
            }
        }
    }
}
