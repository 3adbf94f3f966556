//! Library-Pipeline: task chains of the package library
//!
//! ## Key Components
//!
//! - `chain`: the `Step` trait, ordered `Chain`s and the `ChainRunner` that
//!   executes them against the task ledger
//! - `retry`: per-step retry sets with exponential backoff
//! - `queue`: named worker queues, delayed dispatch and groups
//! - `steps`: every db, packages and git task
//! - `chains`: the `Orchestrator` that assembles and dispatches the five chains
//! - `triggers`: inbound package and distro callbacks
//! - `scheduler`: hourly PR sweep, five-minute reindex, daily cleanup

pub mod chain;
pub mod chains;
pub mod error;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod steps;
pub mod triggers;

pub use chain::{Chain, ChainContext, ChainRunner, Completed, Step};
pub use chains::{BuildRun, Orchestrator};
pub use error::{PipelineError, Result};
pub use queue::{Group, Queue, WorkerPool};
pub use retry::RetryPolicy;
pub use scheduler::{Job, JobOutcome, Scheduler};
pub use steps::{EpochTarget, ReindexTarget, Retention, Services};
