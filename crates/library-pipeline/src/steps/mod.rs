//! Every pipeline task, grouped by the queue it runs on.
//!
//! Steps hold an `Arc<Services>` and nothing else; all per-build state lives
//! in the chain's config and context.

use std::path::PathBuf;
use std::sync::Arc;

use library_core::{BuildConfig, BuildContext, ChannelIndexer, DistroBuildConfig, PackageBuildConfig, Settings};
use library_github::{ArtifactSync, GitHubApi, RecipeRepo};
use library_state::{AdvisoryLock, BuildStore, BuildTarget, RecordId, TaskLedger};
use serde::Serialize;

use crate::error::{PipelineError, Result};

pub mod db;
pub mod git;
pub mod packages;

pub use db::{
    CreatePackageBuild, FindPackagesReadyForIntegration, GetOrCreateDistroBuild, MarkDistroGate,
    MarkUploadedPackage, PurgeTaskResults, UpdateDistroBuildPrUrls, VerifyArchitectures,
};
pub use git::{MergeIntegrationPr, OpenPullRequest, UpdateBuildConfig};
pub use packages::{CopyPackages, FetchArtifact, FindPackagesToCopy, ReindexChannel};

/// Collaborators shared by every step.
pub struct Services {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn BuildStore>,
    pub ledger: Arc<dyn TaskLedger>,
    pub artifacts: ArtifactSync,
    pub recipes: RecipeRepo,
    pub indexer: Arc<dyn ChannelIndexer>,
}

impl Services {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn BuildStore>,
        ledger: Arc<dyn TaskLedger>,
        github: Arc<dyn GitHubApi>,
        lock: Arc<dyn AdvisoryLock>,
        indexer: Arc<dyn ChannelIndexer>,
    ) -> Self {
        Self {
            artifacts: ArtifactSync::new(github.clone(), settings.artifact_size_limit),
            recipes: RecipeRepo::new(github, lock, &settings),
            settings,
            store,
            ledger,
            indexer,
        }
    }
}

/// Config of one epoch's PR sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EpochTarget {
    pub build_target: BuildTarget,
    pub epoch_name: String,
}

/// Config of one standalone reindex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReindexTarget {
    pub channel: PathBuf,
    pub channel_name: String,
}

/// Config of one task-result cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Retention {
    /// Chains whose finished runs are purged.
    pub chains: Vec<&'static str>,
    pub cutoff: chrono::DateTime<chrono::Utc>,
}

pub(crate) fn package_config<'a>(
    step: &'static str,
    config: &'a BuildConfig,
) -> Result<&'a PackageBuildConfig> {
    config.as_package().ok_or(PipelineError::WrongBuildKind {
        step,
        kind: "distro",
    })
}

pub(crate) fn distro_config<'a>(
    step: &'static str,
    config: &'a BuildConfig,
) -> Result<&'a DistroBuildConfig> {
    config.as_distro().ok_or(PipelineError::WrongBuildKind {
        step,
        kind: "package",
    })
}

pub(crate) fn record_id(ctx: &BuildContext) -> Result<RecordId> {
    ctx.record_id.ok_or(PipelineError::MissingRecord("build"))
}
