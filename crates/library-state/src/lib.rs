//! Library-State: entity records and persistence seams for the package library
//!
//! ## Key Components
//!
//! - `schema`: Package, Epoch, Distro, PackageBuild and DistroBuild records
//! - `gate`: the tested/staged/passed gate state machine over build records
//! - `BuildStore`, `AdvisoryLock`, `TaskLedger`: async storage traits
//! - `fakes`: in-memory implementations for tests
//! - `SurrealStore`: SurrealDB implementation of every trait

mod error;
pub mod fakes;
pub mod gate;
pub mod lock;
mod migrations;
pub mod schema;
pub mod storage_traits;
pub mod surreal;

pub use error::{GateError, StorageError};
pub use gate::{parse_distro_artifact, Arch, Gate};
pub use lock::{with_advisory_lock, AdvisoryLock, LockKey, LockUnavailable};
pub use schema::{
    BuildTarget, DistroBuildKey, DistroBuildRecord, DistroRecord, EpochRecord, PackageBuildKey,
    PackageBuildRecord, PackageBuildSummary, PackageRecord, RecordId,
};
pub use storage_traits::{
    BuildStore, StepEvent, StepOutcome, StorageResult, TaskLedger, TaskRun, TaskRunId, TaskStatus,
};
pub use surreal::{SurrealConfig, SurrealStore};
