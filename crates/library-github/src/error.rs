//! Error types for the GitHub integration

use std::path::PathBuf;

use library_core::{ChannelError, Classify, ErrorClass, TransientKind, VersionError};
use library_state::{LockUnavailable, StorageError};
use thiserror::Error;

/// Result type for GitHub operations
pub type Result<T> = std::result::Result<T, GitHubError>;

/// Errors that can occur talking to GitHub or rewriting recipes
#[derive(Error, Debug)]
pub enum GitHubError {
    /// A required request field was empty
    #[error("missing {0}")]
    Missing(&'static str),

    /// Repository was not of the form `owner/repo`
    #[error("invalid repository format: {0}")]
    InvalidRepository(String),

    /// The CI run has not published the artifact yet
    #[error("artifact '{artifact}' not ready: {found} matching records")]
    ArtifactNotReady { artifact: String, found: usize },

    /// More than one artifact carries the requested name
    #[error("artifact '{artifact}' is ambiguous: {found} matching records")]
    AmbiguousArtifact { artifact: String, found: usize },

    /// Artifact exceeds the download ceiling
    #[error("artifact '{artifact}' too large: {size} bytes (limit {limit})")]
    ArtifactTooLarge { artifact: String, size: u64, limit: u64 },

    /// Refusing to clobber an existing download
    #[error("attempting to overwrite file that already exists: {0}")]
    WouldOverwrite(PathBuf),

    /// The recipe lock is held by another worker
    #[error("recipe repository lock is busy")]
    LockNotReady,

    /// Recipe updates only accept the tested and staged gates
    #[error("incorrect gate for recipe update: {0}")]
    InvalidGate(String),

    /// Requested version is older than the recorded one
    #[error("package version conflict for {package}: recorded {recorded}, requested {requested}")]
    VersionConflict {
        package: String,
        recorded: String,
        requested: String,
    },

    /// Recipe content did not have the expected shape
    #[error("malformed recipe {path}: {reason}")]
    MalformedRecipe { path: String, reason: String },

    /// GitHub reported the merge as unsuccessful
    #[error("merging pr {number} failed: {message}")]
    MergeFailed { number: u64, message: String },

    /// 404 from the API
    #[error("not found: {0}")]
    NotFound(String),

    /// Non-success status from the API
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<LockUnavailable> for GitHubError {
    fn from(_: LockUnavailable) -> Self {
        GitHubError::LockNotReady
    }
}

impl GitHubError {
    /// Whether the failure happened below the HTTP status level.
    pub fn is_transport(&self) -> bool {
        self.class() == ErrorClass::Transient(TransientKind::Transport)
    }
}

impl Classify for GitHubError {
    fn class(&self) -> ErrorClass {
        match self {
            GitHubError::ArtifactNotReady { .. } => {
                ErrorClass::Transient(TransientKind::ArtifactNotReady)
            }
            GitHubError::LockNotReady => ErrorClass::Transient(TransientKind::LockNotReady),
            GitHubError::Http(_) => ErrorClass::Transient(TransientKind::Transport),
            // Stale content sha and friends: the branch moved under us.
            GitHubError::Api { status: 409 | 422, .. } => ErrorClass::Conflict,
            GitHubError::Api { status, .. } if *status == 429 || *status >= 500 => {
                ErrorClass::Transient(TransientKind::Transport)
            }
            GitHubError::VersionConflict { .. } => ErrorClass::Conflict,
            GitHubError::Missing(_)
            | GitHubError::InvalidRepository(_)
            | GitHubError::AmbiguousArtifact { .. }
            | GitHubError::ArtifactTooLarge { .. }
            | GitHubError::InvalidGate(_)
            | GitHubError::MalformedRecipe { .. }
            | GitHubError::NotFound(_)
            | GitHubError::Yaml(_) => ErrorClass::Validation,
            GitHubError::Version(e) => e.class(),
            GitHubError::Channel(e) => e.class(),
            GitHubError::Storage(e) => e.class(),
            _ => ErrorClass::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_signals() {
        let err = GitHubError::ArtifactNotReady {
            artifact: "linux-64".to_string(),
            found: 0,
        };
        assert_eq!(err.class().transient_kind(), Some(TransientKind::ArtifactNotReady));
        assert_eq!(
            GitHubError::LockNotReady.class().transient_kind(),
            Some(TransientKind::LockNotReady)
        );
        let err = GitHubError::Api {
            status: 502,
            message: "bad gateway".to_string(),
        };
        assert!(err.is_transport());
    }

    #[test]
    fn test_stale_sha_is_fatal_conflict() {
        let err = GitHubError::Api {
            status: 409,
            message: "sha does not match".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::Conflict);
        assert_eq!(err.class().transient_kind(), None);
    }

    #[test]
    fn test_oversize_and_ambiguous_are_validation() {
        let err = GitHubError::ArtifactTooLarge {
            artifact: "osx-64".to_string(),
            size: 200_000_000,
            limit: 100_000_000,
        };
        assert_eq!(err.class(), ErrorClass::Validation);
        let err = GitHubError::AmbiguousArtifact {
            artifact: "osx-64".to_string(),
            found: 2,
        };
        assert_eq!(err.class(), ErrorClass::Validation);
    }

    #[test]
    fn test_lock_unavailable_converts_to_lock_not_ready() {
        let err: GitHubError = LockUnavailable(library_state::LockKey(42)).into();
        assert!(matches!(err, GitHubError::LockNotReady));
    }
}
