//! Execution driver: one Run of the code generator, bounded by a deadline
//! and externally cancellable.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use super::gate::RepositorySlots;
use super::generator::{CodeGenerator, GeneratorInvocation};
use super::prompt::compose_instruction;
use crate::domain::{Mode, Repository};
use crate::errors::ExecutionError;
use crate::hosting::Identity;
use crate::stream::{ProgressEvent, RunResult, StreamParser};

pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Driver configuration shared by every Run.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub timeout: Duration,
    pub max_frame_bytes: usize,
    /// Repositories are checked out at `<workspace>/<owner>/<name>`.
    pub workspace: PathBuf,
    pub co_author: Identity,
}

/// What to run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub prompt: String,
    pub mode: Mode,
    pub resume_token: Option<String>,
    pub repository: Arc<Repository>,
}

/// A Run that produced a terminal result.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub result: RunResult,
    /// Token to resume the generator's context on the next Run.
    pub resume_token: Option<String>,
}

pub struct ExecutionDriver {
    generator: Arc<dyn CodeGenerator>,
    slots: Arc<RepositorySlots>,
    parser: StreamParser,
    settings: DriverSettings,
}

impl ExecutionDriver {
    pub fn new(
        generator: Arc<dyn CodeGenerator>,
        slots: Arc<RepositorySlots>,
        settings: DriverSettings,
    ) -> Self {
        Self {
            generator,
            slots,
            parser: StreamParser::new(settings.max_frame_bytes),
            settings,
        }
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub fn working_dir(&self, repository: &Repository) -> PathBuf {
        self.settings
            .workspace
            .join(&repository.owner)
            .join(&repository.name)
    }

    /// Execute one Run, forwarding progress in stream order.
    ///
    /// Outcome precedence: cancellation or deadline first, then a seen result
    /// frame (even on non-zero exit), then a clean exit without a result, then
    /// a failed exit with its diagnostics.
    pub async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
        progress: mpsc::Sender<ProgressEvent>,
    ) -> Result<RunOutcome, ExecutionError> {
        let timeout = self.settings.timeout;
        let deadline = Instant::now() + timeout;
        let repo_key = request.repository.key();

        // Held until this function returns, on every path.
        let _slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
            _ = sleep_until(deadline) => return Err(ExecutionError::TimedOut { after: timeout }),
            slot = self.slots.acquire(&request.repository) => slot?,
        };
        tracing::debug!(repository = %repo_key, "acquired repository slot");

        let invocation = GeneratorInvocation {
            instruction: compose_instruction(
                request.mode,
                &request.prompt,
                &request.repository,
                &self.settings.co_author,
            ),
            working_dir: self.working_dir(&request.repository),
            resume_token: request.resume_token.clone(),
        };
        let mut process = self.generator.start(&invocation)?;
        let stdout = process.take_stdout().ok_or_else(|| {
            ExecutionError::Process(std::io::Error::other("generator stdout was not captured"))
        })?;

        let parsed = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                process.kill().await;
                return Err(ExecutionError::Cancelled);
            }
            _ = sleep_until(deadline) => {
                process.kill().await;
                return Err(ExecutionError::TimedOut { after: timeout });
            }
            parsed = self.parser.parse(stdout, &progress) => parsed,
        };
        let summary = match parsed {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!(repository = %repo_key, error = %e, "aborting run on stream error");
                process.kill().await;
                return Err(e.into());
            }
        };

        let exit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                process.kill().await;
                return Err(ExecutionError::Cancelled);
            }
            _ = sleep_until(deadline) => {
                process.kill().await;
                return Err(ExecutionError::TimedOut { after: timeout });
            }
            exit = process.wait() => exit?,
        };
        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        if !exit.stderr.is_empty() {
            tracing::warn!(repository = %repo_key, code = exit.code, stderr = %exit.stderr, "generator wrote to stderr");
        }

        match summary.result {
            Some(result) => {
                if !exit.success {
                    tracing::warn!(repository = %repo_key, code = exit.code, "generator exited non-zero after a result");
                }
                let resume_token = summary.session_id.or_else(|| result.session_id.clone());
                Ok(RunOutcome {
                    result,
                    resume_token,
                })
            }
            None if exit.success => Err(ExecutionError::NoTerminalResult),
            None => Err(ExecutionError::GeneratorFailed {
                code: exit.code,
                stderr: exit.stderr,
            }),
        }
    }
}
