//! Typed error hierarchy for the task execution engine.
//!
//! Four types cover the failure domains:
//! - `StreamError`: fatal stream protocol failures (oversized frame, broken pipe)
//! - `ExecutionError`: a single Run failing to produce a result
//! - `PublishError`: a step of the repository change transaction failing
//! - `TransitionError`: an invalid session state transition

use std::time::Duration;

use thiserror::Error;

use crate::domain::session::SessionState;

/// Fatal errors from the stream protocol decoder.
///
/// Malformed frames are not errors; they are skipped by the parser.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Stream frame exceeded the {limit} byte buffer (truncated tool output?)")]
    FrameTooLarge { limit: usize },

    #[error("Failed to read generator output: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a single Run of the code generator.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Run was cancelled")]
    Cancelled,

    #[error("Run timed out after {}s", .after.as_secs())]
    TimedOut { after: Duration },

    #[error("Failed to spawn code generator '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Generator output protocol error: {0}")]
    Protocol(#[from] StreamError),

    #[error("Generator finished without a terminal result")]
    NoTerminalResult,

    #[error("Generator exited with {} without a result: {stderr}", exit_label(.code))]
    GeneratorFailed { code: Option<i32>, stderr: String },

    #[error("Concurrency slots for {repository} are closed")]
    SlotsClosed { repository: String },

    #[error("Generator process error: {0}")]
    Process(#[source] std::io::Error),
}

impl ExecutionError {
    /// Whether the Run ended because of cancellation or its deadline.
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Cancelled | Self::TimedOut { .. })
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    }
}

/// The step of the change transaction that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStep {
    ReadBaseRef,
    CreateBranch,
    CreateBlob,
    ReadBaseCommit,
    CreateTree,
    CreateCommit,
    UpdateBranch,
    OpenPullRequest,
}

impl PublishStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadBaseRef => "read the default branch ref",
            Self::CreateBranch => "create the branch",
            Self::CreateBlob => "create a blob",
            Self::ReadBaseCommit => "read the base commit",
            Self::CreateTree => "create the tree",
            Self::CreateCommit => "create the commit",
            Self::UpdateBranch => "advance the branch",
            Self::OpenPullRequest => "open the pull request",
        }
    }
}

impl std::fmt::Display for PublishStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed change transaction. `branch` is set when a branch had been
/// created before the failure; `compensated` records whether it was
/// deleted again or is left behind on the host.
#[derive(Debug, Error)]
#[error("Failed to {step}: {source:#}")]
pub struct PublishError {
    pub step: PublishStep,
    pub branch: Option<String>,
    pub compensated: bool,
    #[source]
    pub source: anyhow::Error,
}

/// Errors from invalid session state transitions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Cannot move session from {from} to {to}")]
    Invalid { from: SessionState, to: SessionState },
}
