//! Error types for chain execution

use library_core::{ChannelError, Classify, ConfigError, ErrorClass, VersionError};
use library_github::GitHubError;
use library_state::{GateError, StorageError, TaskRunId};
use thiserror::Error;

use crate::queue::Queue;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised by steps, chains and triggers
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    GitHub(#[from] GitHubError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Version(#[from] VersionError),

    /// Trigger presented the wrong shared secret
    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),

    /// A step ran before the record it needs was created
    #[error("context has no {0} record")]
    MissingRecord(&'static str),

    /// A step received the wrong config variant
    #[error("step {step} cannot run on a {kind} build")]
    WrongBuildKind { step: &'static str, kind: &'static str },

    #[error("queue {0} is closed")]
    QueueClosed(Queue),

    /// A dispatched chain panicked or was cancelled
    #[error("dispatched chain did not finish: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// A chain stopped at `step`
    #[error("chain {chain} failed at {step} (run {run_id}): {source}")]
    ChainFailed {
        chain: &'static str,
        run_id: TaskRunId,
        step: &'static str,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    /// The error a failed chain ended with, or `self`.
    pub fn root(&self) -> &PipelineError {
        match self {
            PipelineError::ChainFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

impl Classify for PipelineError {
    fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Storage(e) => e.class(),
            PipelineError::Gate(e) => e.class(),
            PipelineError::GitHub(e) => e.class(),
            PipelineError::Channel(e) => e.class(),
            PipelineError::Config(e) => e.class(),
            PipelineError::Version(e) => e.class(),
            PipelineError::Unauthorized(_) => ErrorClass::Authorization,
            PipelineError::WrongBuildKind { .. } => ErrorClass::Validation,
            PipelineError::MissingRecord(_)
            | PipelineError::QueueClosed(_)
            | PipelineError::Join(_) => ErrorClass::Internal,
            PipelineError::ChainFailed { source, .. } => source.class(),
        }
    }
}
