//! Error types for library-state

use thiserror::Error;

/// Errors raised by the gate state machine on build records.
///
/// These are structural mismatches between a callback and the record it
/// targets, so retrying can never change the outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    /// The gate is not valid for this kind of record.
    #[error("invalid gate '{gate}' for {record}")]
    InvalidGate { gate: String, record: &'static str },

    /// The architecture component is not one of the supported set.
    #[error("invalid architecture: {0}")]
    InvalidArchitecture(String),

    /// The artifact name could not be split into `<distro>-<arch>`.
    #[error("malformed artifact name: {0}")]
    MalformedArtifactName(String),

    /// The distro component of the artifact name names a different distro.
    #[error("artifact is for distro '{found}', record belongs to '{expected}'")]
    DistroMismatch { expected: String, found: String },

    /// A pull request URL was already recorded for this distro build.
    #[error("a pr already exists for this distro build: {existing} vs {requested}")]
    PrUrlAlreadySet { existing: String, requested: String },
}

/// Errors from the storage traits (`BuildStore`, `AdvisoryLock`, `TaskLedger`).
#[derive(Error, Debug)]
pub enum StorageError {
    /// No package is registered under the given token.
    #[error("no package registered for token")]
    UnknownPackageToken,

    /// A named record was not found.
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    /// A task run was not found.
    #[error("task run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// The task run is not in the expected state for the operation.
    #[error("task run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        status: String,
        expected: String,
    },

    /// A gate transition was rejected.
    #[error(transparent)]
    Gate(#[from] GateError),

    /// Backend-specific failure.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Serialization failure.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl StorageError {
    pub(crate) fn not_found(kind: &'static str, key: impl std::fmt::Display) -> Self {
        StorageError::NotFound {
            kind,
            key: key.to_string(),
        }
    }
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distro_mismatch_displays_both_names() {
        let err = GateError::DistroMismatch {
            expected: "core".to_string(),
            found: "amplicon".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("core"));
        assert!(msg.contains("amplicon"));
    }

    #[test]
    fn test_gate_error_converts_into_storage_error() {
        let err: StorageError = GateError::InvalidArchitecture("win".to_string()).into();
        assert!(matches!(err, StorageError::Gate(GateError::InvalidArchitecture(_))));
        assert!(err.to_string().contains("win"));
    }
}
