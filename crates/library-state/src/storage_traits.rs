//! Storage trait definitions for the package library
//!
//! These traits define the persistence seams of the pipeline:
//! - `BuildStore`: packages, epochs, distros and their build records
//! - `TaskLedger`: chain executions and their step outcomes (task results)
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module, a SurrealDB backend via `surreal`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::gate::{Arch, Gate};
use crate::schema::{
    BuildTarget, DistroBuildKey, DistroBuildRecord, DistroRecord, EpochRecord, PackageBuildKey,
    PackageBuildRecord, PackageBuildSummary, PackageRecord, RecordId,
};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// BuildStore - entity persistence
// ---------------------------------------------------------------------------

/// Get/create/update access to the pipeline's entities.
///
/// Guarantees:
/// - `get_or_create_*` is idempotent on the record's key, also when two
///   callers race to create the same key.
/// - `save_*` replaces the whole stored record with the same id.
/// - `mark_*`, `stamp_distro_run`, `attach_package_builds` and
///   `set_distro_pr_url` write only their own fields, so concurrent chains
///   on one record never undo each other. Architecture flags never revert.
/// - `ready_for_integration` never returns a build already attached to a
///   distro build.
#[async_trait]
pub trait BuildStore: Send + Sync {
    /// Resolve a registration token. `UnknownPackageToken` if none matches.
    async fn package_by_token(&self, token: &str) -> StorageResult<PackageRecord>;

    /// Record the name and repository reported by a package's build.
    async fn sync_package(
        &self,
        id: &RecordId,
        name: &str,
        repository: &str,
    ) -> StorageResult<PackageRecord>;

    async fn epoch_by_name(&self, name: &str) -> StorageResult<EpochRecord>;

    /// Epochs included in CI whose dev flag matches `target`.
    async fn epochs_by_build_target(&self, target: BuildTarget) -> StorageResult<Vec<EpochRecord>>;

    async fn distro_by_name(&self, name: &str) -> StorageResult<DistroRecord>;

    /// All distros, ordered by name.
    async fn list_distros(&self) -> StorageResult<Vec<DistroRecord>>;

    /// Distros that belong to `epoch_id`, ordered by name.
    async fn distros_in_epoch(&self, epoch_id: &RecordId) -> StorageResult<Vec<DistroRecord>>;

    async fn get_or_create_package_build(
        &self,
        key: PackageBuildKey,
    ) -> StorageResult<PackageBuildRecord>;

    async fn get_package_build(&self, id: &RecordId) -> StorageResult<PackageBuildRecord>;

    async fn save_package_build(&self, record: &PackageBuildRecord) -> StorageResult<()>;

    /// Set one architecture flag, returning the record after the write.
    async fn mark_package_architecture(
        &self,
        id: &RecordId,
        arch: Arch,
    ) -> StorageResult<PackageBuildRecord>;

    /// Fully tested, unattached builds in `epoch_name` for packages of `distro`,
    /// in creation order.
    async fn ready_for_integration(
        &self,
        epoch_name: &str,
        distro: &DistroRecord,
    ) -> StorageResult<Vec<PackageBuildSummary>>;

    /// Find the distro build for `key`, creating an empty one if missing.
    async fn get_or_create_distro_build(
        &self,
        key: DistroBuildKey,
    ) -> StorageResult<DistroBuildRecord>;

    async fn get_distro_build(&self, id: &RecordId) -> StorageResult<DistroBuildRecord>;

    async fn save_distro_build(&self, record: &DistroBuildRecord) -> StorageResult<()>;

    /// Set one architecture flag of `gate` (`staged` or `passed`).
    async fn mark_distro_architecture(
        &self,
        id: &RecordId,
        gate: Gate,
        arch: Arch,
    ) -> StorageResult<DistroBuildRecord>;

    /// Record the CI run that reported `gate`.
    async fn stamp_distro_run(
        &self,
        id: &RecordId,
        gate: Gate,
        run_id: &str,
    ) -> StorageResult<DistroBuildRecord>;

    /// Add package builds to the set a distro build subsumes.
    async fn attach_package_builds(
        &self,
        id: &RecordId,
        package_build_ids: &[RecordId],
    ) -> StorageResult<DistroBuildRecord>;

    /// Record the integration PR url. `GateError::PrUrlAlreadySet` if the
    /// record already has one.
    async fn set_distro_pr_url(&self, id: &RecordId, pr_url: &str)
        -> StorageResult<DistroBuildRecord>;
}

// ---------------------------------------------------------------------------
// TaskLedger - chain execution results
// ---------------------------------------------------------------------------

/// Unique identifier for one chain execution
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRunId(pub String);

impl TaskRunId {
    /// Generate a new random id
    pub fn new() -> Self {
        TaskRunId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for TaskRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a single step of a chain ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    /// Passed through because the context reported missing architectures.
    Skipped,
    Failed,
}

/// A single step event in a chain execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEvent {
    /// Monotonic sequence number within the run
    pub seq: u64,
    /// Step name (e.g. "packages.fetch_package_from_github")
    pub step: String,
    pub outcome: StepOutcome,
    /// Attempts used, including the first
    pub attempts: u32,
    /// Context snapshot after the step, or the error
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Status of a chain execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Full record of one chain execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub run_id: TaskRunId,
    /// Chain name (e.g. "pipeline.handle_new_package_build")
    pub chain: String,
    /// What the chain is about (package, distro, epoch)
    pub subject: String,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Task-result ledger.
///
/// Guarantees:
/// - Step events are ordered by monotonic `seq` within a run.
/// - A run transitions: Running → Completed | Failed (terminal).
/// - Finished runs are immutable until purged.
#[async_trait]
pub trait TaskLedger: Send + Sync {
    /// Open a new run, returning its id.
    async fn create_run(&self, chain: &str, subject: &str) -> StorageResult<TaskRunId>;

    /// Append a step event. Fails if the run is finished.
    async fn append_step(&self, run_id: &TaskRunId, event: StepEvent) -> StorageResult<()>;

    /// Mark a run as completed.
    async fn complete_run(&self, run_id: &TaskRunId) -> StorageResult<()>;

    /// Mark a run as failed with the surfaced error.
    async fn fail_run(&self, run_id: &TaskRunId, error: &str) -> StorageResult<()>;

    async fn get_run(&self, run_id: &TaskRunId) -> StorageResult<TaskRun>;

    /// Step events of a run, ordered by seq.
    async fn get_steps(&self, run_id: &TaskRunId) -> StorageResult<Vec<StepEvent>>;

    /// Runs, optionally filtered by status, newest first.
    async fn list_runs(&self, status: Option<TaskStatus>) -> StorageResult<Vec<TaskRun>>;

    /// Delete finished runs of `chains` completed before `cutoff`.
    /// Returns the number of runs removed.
    async fn purge_finished(&self, chains: &[&str], cutoff: DateTime<Utc>)
        -> StorageResult<usize>;
}
