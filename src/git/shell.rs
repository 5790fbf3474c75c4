//! git::shell
//!
//! Async subprocess runner.
//!
//! # Design
//!
//! Every git invocation flows through [`Shell::run`]. The shell captures
//! stdout and stderr, never inherits the terminal, and never raises on a
//! non-zero exit: callers decide what an exit code means. A bounded
//! [`Semaphore`] caps concurrent subprocesses at the machine's available
//! parallelism.
//!
//! Environment variables passed per-call are additive on top of the parent
//! environment, so `GIT_INDEX_FILE` or `GIT_COMMITTER_DATE` can be injected
//! without disturbing anything else.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;

use crate::ui::output::{self, Verbosity};

/// Errors from spawning subprocesses.
///
/// A process that runs and exits non-zero is not an error at this layer;
/// only failure to run it at all is.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("failed to run '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
}

/// Captured result of one subprocess run.
#[derive(Debug, Clone)]
pub struct ShellOutput {
    /// Exit code; -1 when the process was killed by a signal.
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    /// Whether the process exited zero.
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// An async shell with a fixed working directory and a process pool.
#[derive(Debug, Clone)]
pub struct Shell {
    cwd: PathBuf,
    verbosity: Verbosity,
    pool: Arc<Semaphore>,
}

impl Shell {
    /// Create a shell rooted at `cwd`.
    pub fn new(cwd: impl Into<PathBuf>, verbosity: Verbosity) -> Self {
        let permits = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            cwd: cwd.into(),
            verbosity,
            pool: Arc::new(Semaphore::new(permits)),
        }
    }

    /// The shell's working directory.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// The shell's verbosity.
    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    /// Return a shell identical to this one but rooted elsewhere.
    ///
    /// Used once at startup, after the repository root is discovered. The
    /// process pool is shared with the original.
    pub fn with_cwd(&self, cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            verbosity: self.verbosity,
            pool: Arc::clone(&self.pool),
        }
    }

    /// Run a command, capturing output.
    pub async fn run(&self, program: &str, args: &[&str]) -> Result<ShellOutput, ShellError> {
        self.run_with(program, args, &[], None).await
    }

    /// Run a command with additional environment variables and optional
    /// stdin content.
    pub async fn run_with(
        &self,
        program: &str,
        args: &[&str],
        env: &[(&str, &str)],
        stdin: Option<&str>,
    ) -> Result<ShellOutput, ShellError> {
        let _permit = self.pool.acquire().await.expect("process pool closed");

        let command_line =
            output::quote_command(std::iter::once(program).chain(args.iter().copied()));
        output::debug(format!("$ {}", command_line), self.verbosity);

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&self.cwd)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| ShellError::Spawn {
            command: command_line.clone(),
            source,
        })?;

        let writer = stdin.map(|input| {
            let mut handle = child.stdin.take().expect("stdin was piped");
            let input = input.to_string();
            tokio::spawn(async move {
                let _ = handle.write_all(input.as_bytes()).await;
                let _ = handle.shutdown().await;
            })
        });

        let raw = child
            .wait_with_output()
            .await
            .map_err(|source| ShellError::Spawn {
                command: command_line.clone(),
                source,
            })?;
        if let Some(writer) = writer {
            let _ = writer.await;
        }

        let result = ShellOutput {
            status: raw.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&raw.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&raw.stderr).into_owned(),
        };
        if !result.success() {
            output::debug(
                format!("exit {}: {}", result.status, result.stderr.trim_end()),
                self.verbosity,
            );
        }
        Ok(result)
    }
}
