//! External tool invocation
//!
//! Backends and the converter shell out to command-line tools. [`Tool`]
//! runs one to completion with stdout and stderr captured, optionally
//! killing it when it outlives its time budget.

use crate::error::{BackendError, ConvertError};
use std::ffi::{OsStr, OsString};
use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Polling interval while waiting on a child with a deadline
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Captured output of a successful run
#[derive(Debug, Default)]
pub struct ToolOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ToolOutput {
    /// Stdout decoded lossily as UTF-8
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Why a tool run failed
#[derive(Error, Debug)]
pub enum ToolFailure {
    /// Could not spawn the process
    #[error("cannot launch '{tool}': {source}")]
    Launch {
        tool: String,
        #[source]
        source: io::Error,
    },

    /// Process exited unsuccessfully
    #[error("{tool} failed ({status}) -- {stderr}")]
    Exit {
        tool: String,
        status: ExitStatus,
        stderr: String,
    },

    /// Process ran past its deadline and was killed
    #[error("{tool} timed out after {secs}s")]
    Timeout { tool: String, secs: u64 },

    /// Waiting on the process failed
    #[error("{tool}: {source}")]
    Io {
        tool: String,
        #[source]
        source: io::Error,
    },
}

impl From<ToolFailure> for BackendError {
    fn from(failure: ToolFailure) -> Self {
        match failure {
            ToolFailure::Launch { tool, source } => BackendError::Launch {
                tool,
                reason: source.to_string(),
            },
            ToolFailure::Exit { tool, stderr, .. } => BackendError::ToolFailed { tool, stderr },
            ToolFailure::Timeout { tool, secs } => BackendError::Timeout { tool, secs },
            ToolFailure::Io { tool, source } => BackendError::ToolFailed {
                tool,
                stderr: source.to_string(),
            },
        }
    }
}

impl From<ToolFailure> for ConvertError {
    fn from(failure: ToolFailure) -> Self {
        match failure {
            ToolFailure::Launch { tool, source } => ConvertError::Launch {
                tool,
                reason: source.to_string(),
            },
            ToolFailure::Exit { tool, stderr, .. } => ConvertError::ToolFailed { tool, stderr },
            ToolFailure::Timeout { tool, secs } => ConvertError::Timeout { tool, secs },
            ToolFailure::Io { tool, source } => ConvertError::ToolFailed {
                tool,
                stderr: source.to_string(),
            },
        }
    }
}

/// A command-line tool with an optional time budget
#[derive(Debug, Clone)]
pub struct Tool {
    program: OsString,
    timeout: Option<Duration>,
}

impl Tool {
    /// Create a tool runner for `program` (looked up on PATH if bare)
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            timeout: None,
        }
    }

    /// Kill runs that exceed `timeout`; `None` waits forever
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Display name of the tool
    pub fn name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    /// Check that the tool can be launched and exits cleanly with `args`
    pub fn is_available<I, S>(&self, args: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    /// Run to completion, returning captured output on a zero exit
    pub fn run<I, S>(&self, args: I) -> Result<ToolOutput, ToolFailure>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let tool = self.name();
        let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        debug!(tool = %tool, args = ?args, "Running tool");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ToolFailure::Launch {
                tool: tool.clone(),
                source,
            })?;

        // Drain both pipes concurrently so a chatty child never blocks
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match self.wait(&mut child) {
            Ok(Some(status)) => status,
            Ok(None) => {
                // Drain threads are left detached: a grandchild may still
                // hold the pipes open after the kill.
                let secs = self.timeout.map(|t| t.as_secs()).unwrap_or_default();
                warn!(tool = %tool, secs, "Tool timed out, killed");
                return Err(ToolFailure::Timeout { tool, secs });
            }
            Err(source) => return Err(ToolFailure::Io { tool, source }),
        };

        let stdout = join_drain(stdout);
        let stderr = String::from_utf8_lossy(&join_drain(stderr)).trim().to_string();

        if !status.success() {
            return Err(ToolFailure::Exit {
                tool,
                status,
                stderr,
            });
        }

        Ok(ToolOutput { stdout, stderr })
    }

    /// Wait for the child; `Ok(None)` means it was killed at the deadline
    fn wait(&self, child: &mut Child) -> io::Result<Option<ExitStatus>> {
        let Some(timeout) = self.timeout else {
            return child.wait().map(Some);
        };

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                // Already-exited races surface as an error from kill; ignore it
                let _ = child.kill();
                child.wait()?;
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn join_drain(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}
