use serde::{Deserialize, Serialize};

use crate::job::JobStatus;

/// Reason a single render attempt failed.
///
/// All variants are per-viewport and retryable; the orchestrator retries up
/// to the configured attempt limit before counting the viewport as
/// permanently failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum RenderFailure {
    #[error("navigation did not reach stability within the timeout")]
    NavigationTimeout,

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("page crashed: {0}")]
    PageCrashed(String),
}

/// Machine-readable kind for a terminal job failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// Too many viewports permanently failed to meet the success threshold.
    InsufficientCoverage,
    /// Coverage data handed to the merger violated its invariants.
    MergeError,
    /// The job-level processing deadline elapsed.
    JobTimeout,
    /// The target host was unreachable before any viewport was dispatched.
    HostUnreachable,
}

/// Terminal failure recorded on a job: a machine-readable kind plus a
/// human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown viewport profile: {0}")]
    UnknownViewport(String),

    #[error("no viewport profiles requested")]
    NoViewports,

    #[error("invalid target url: {0}")]
    InvalidTargetUrl(String),

    #[error("job not found")]
    JobNotFound,

    #[error("illegal job state transition: {from:?} -> {to:?}")]
    IllegalTransition { from: JobStatus, to: JobStatus },

    #[error("merge error: {0}")]
    Merge(String),

    #[error("job store error: {0}")]
    Store(String),

    #[error("artifact store error: {0}")]
    Artifact(String),

    #[error("engine channel closed")]
    ChannelClosed,

    #[error("engine is already running")]
    AlreadyRunning,
}
