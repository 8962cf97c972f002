//! The code generator capability and its CLI adapter.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::errors::ExecutionError;

/// Stderr kept for diagnostics; the tail is what explains a failure.
const STDERR_TAIL_BYTES: usize = 8 * 1024;

/// One request to the generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorInvocation {
    /// Full outbound instruction, rules included.
    pub instruction: String,
    pub working_dir: PathBuf,
    pub resume_token: Option<String>,
}

/// How the generator process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub success: bool,
    pub stderr: String,
}

pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// A started generator process.
#[async_trait]
pub trait GeneratorProcess: Send {
    /// The line-delimited JSON output. Available once.
    fn take_stdout(&mut self) -> Option<OutputStream>;

    /// Wait for exit and collect diagnostics.
    async fn wait(&mut self) -> Result<ExitReport, ExecutionError>;

    /// Terminate the process. Safe to call after it exited.
    async fn kill(&mut self);
}

/// Starts generator processes.
///
/// Real implementation: `ClaudeCli`. Test double: `ScriptedGenerator`.
pub trait CodeGenerator: Send + Sync {
    fn start(
        &self,
        invocation: &GeneratorInvocation,
    ) -> Result<Box<dyn GeneratorProcess>, ExecutionError>;
}

/// Runs the `claude` CLI in print mode with streamed JSON output.
#[derive(Debug, Clone)]
pub struct ClaudeCli {
    command: String,
    extra_args: Vec<String>,
}

impl ClaudeCli {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    fn args(&self, invocation: &GeneratorInvocation) -> Vec<String> {
        let mut args: Vec<String> = [
            "--print",
            "--output-format",
            "stream-json",
            "--verbose",
            "--dangerously-skip-permissions",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if let Some(token) = &invocation.resume_token {
            args.push("--resume".to_string());
            args.push(token.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        args.push(invocation.instruction.clone());
        args
    }
}

impl CodeGenerator for ClaudeCli {
    fn start(
        &self,
        invocation: &GeneratorInvocation,
    ) -> Result<Box<dyn GeneratorProcess>, ExecutionError> {
        let mut child = Command::new(&self.command)
            .args(self.args(invocation))
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutionError::SpawnFailed {
                command: self.command.clone(),
                source,
            })?;

        tracing::info!(
            command = %self.command,
            workdir = %invocation.working_dir.display(),
            resume = invocation.resume_token.is_some(),
            pid = child.id(),
            "started code generator"
        );

        let stderr = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                if let Err(e) = stderr.read_to_end(&mut buf).await {
                    tracing::debug!(error = %e, "failed to read generator stderr");
                }
                let start = buf.len().saturating_sub(STDERR_TAIL_BYTES);
                String::from_utf8_lossy(&buf[start..]).trim().to_string()
            })
        });

        Ok(Box::new(CliProcess { child, stderr }))
    }
}

struct CliProcess {
    child: Child,
    stderr: Option<JoinHandle<String>>,
}

#[async_trait]
impl GeneratorProcess for CliProcess {
    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.child
            .stdout
            .take()
            .map(|stdout| Box::new(stdout) as OutputStream)
    }

    async fn wait(&mut self) -> Result<ExitReport, ExecutionError> {
        let status = self.child.wait().await.map_err(ExecutionError::Process)?;
        let stderr = match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        Ok(ExitReport {
            code: status.code(),
            success: status.success(),
            stderr,
        })
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(error = %e, "generator kill failed (already exited?)");
        }
        if let Some(handle) = self.stderr.take() {
            handle.abort();
        }
    }
}
