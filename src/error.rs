use std::io;

use thiserror::Error;

/// Errors raised while expanding, grouping, or executing a step.
#[derive(Debug, Error)]
pub enum StepError {
    /// A referenced target resolves to nothing: no file, no glob match.
    #[error("unknown target: {0}")]
    UnknownTarget(String),

    /// A target that resolved earlier is gone by the time the body runs.
    #[error("target removed before execution: {0}")]
    RemovedTarget(String),

    /// Another actor holds the signature lock.
    #[error("signature lock unavailable: {0}")]
    UnavailableLock(String),

    #[error("{0}")]
    Validation(String),

    #[error("failed to resolve {value} of type {kind} as a target")]
    Resolution { value: String, kind: String },

    #[error("signature mismatch for substep {index} of step '{step}' (sig_mode=assert)")]
    SignatureMismatch { step: String, index: usize },

    #[error("internal invariant violated: {0}")]
    Invariant(String),

    #[error("step terminated: {0}")]
    Terminated(String),

    /// Body failure, already formatted with a source snippet.
    #[error("{0}")]
    Execution(String),

    #[error("{count} task(s) failed: {details}")]
    TaskFailed { count: usize, details: String },

    #[error("interrupted")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StepError {
    pub fn validation(msg: impl Into<String>) -> Self {
        StepError::Validation(msg.into())
    }

    /// Whether an outer orchestration layer may retry the step later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StepError::UnknownTarget(_) | StepError::UnavailableLock(_)
        )
    }
}

pub type Result<T, E = StepError> = std::result::Result<T, E>;
