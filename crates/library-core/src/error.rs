//! Error taxonomy shared by every pipeline layer.
//!
//! Each crate keeps its own `thiserror` enum; [`Classify`] maps those onto
//! one [`ErrorClass`] so retry decisions never inspect concrete types.

use library_state::{GateError, StorageError};
use serde::{Deserialize, Serialize};

/// Transient conditions a step may opt into retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientKind {
    /// The CI run has not published the requested artifact yet.
    ArtifactNotReady,
    /// Another worker holds the recipe repository lock.
    LockNotReady,
    /// Network or HTTP transport failure.
    Transport,
}

/// How an error should be treated by the chain executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient(TransientKind),
    /// Structural mismatch, retrying cannot help.
    Validation,
    /// Data-integrity issue needing a human.
    Conflict,
    /// Rejected at the trigger boundary.
    Authorization,
    Internal,
}

impl ErrorClass {
    pub fn transient_kind(&self) -> Option<TransientKind> {
        match self {
            ErrorClass::Transient(kind) => Some(*kind),
            _ => None,
        }
    }
}

/// Errors that know their [`ErrorClass`].
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

impl Classify for GateError {
    fn class(&self) -> ErrorClass {
        match self {
            GateError::PrUrlAlreadySet { .. } => ErrorClass::Conflict,
            _ => ErrorClass::Validation,
        }
    }
}

impl Classify for StorageError {
    fn class(&self) -> ErrorClass {
        match self {
            StorageError::Gate(e) => e.class(),
            StorageError::UnknownPackageToken => ErrorClass::Authorization,
            StorageError::NotFound { .. } => ErrorClass::Validation,
            _ => ErrorClass::Internal,
        }
    }
}

/// Errors from version parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    #[error("invalid version: '{0}'")]
    Invalid(String),
}

impl Classify for VersionError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Validation
    }
}

/// Errors from the channel file store and index command.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("expected exactly one file matching '{pattern}' in {dir}, found {found}")]
    FileCountMismatch {
        pattern: String,
        dir: String,
        found: usize,
    },

    #[error("invalid file pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("index command is empty")]
    EmptyCommand,

    #[error("index command for {channel} timed out after {secs} seconds")]
    Timeout { channel: String, secs: u64 },

    #[error("index command for {channel} exited with {code}: {stderr}")]
    IndexFailed {
        channel: String,
        code: i32,
        stderr: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for ChannelError {
    fn class(&self) -> ErrorClass {
        match self {
            ChannelError::FileCountMismatch { .. } => ErrorClass::Conflict,
            ChannelError::Pattern { .. } | ChannelError::EmptyCommand => ErrorClass::Validation,
            _ => ErrorClass::Internal,
        }
    }
}

/// Errors from build configuration construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    Missing(&'static str),

    #[error("invalid gate '{0}' for this build")]
    InvalidGate(String),

    #[error("unknown build target: {0}")]
    UnknownBuildTarget(String),
}

impl Classify for ConfigError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Validation
    }
}
