//! The pipeline's chains and their dispatch.
//!
//! Build chains are dispatched after the configured delay so near-simultaneous
//! per-architecture callbacks for one run land on the same record. Periodic
//! chains fan out as groups: one member per epoch (sweep) or per channel
//! (reindex), with no ordering or fan-in between members.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use library_core::{BuildConfig, BuildContext, DistroBuildConfig, PackageBuildConfig, SweepContext};
use library_state::{BuildTarget, EpochRecord, Gate};
use tokio::task::JoinHandle;
use tracing::info;

use crate::chain::{Chain, ChainContext, ChainRunner, Completed};
use crate::error::Result;
use crate::queue::{Group, WorkerPool};
use crate::steps::{
    CopyPackages, CreatePackageBuild, EpochTarget, FetchArtifact, FindPackagesReadyForIntegration,
    FindPackagesToCopy, GetOrCreateDistroBuild, MarkDistroGate, MarkUploadedPackage,
    MergeIntegrationPr, OpenPullRequest, PurgeTaskResults, ReindexChannel, ReindexTarget, Retention,
    Services, UpdateBuildConfig, UpdateDistroBuildPrUrls, VerifyArchitectures,
};

pub const NEW_PACKAGE_BUILD: &str = "pipeline.handle_new_builds";
pub const NEW_DISTRO_BUILD: &str = "pipeline.handle_new_distro_build";
pub const PASSED_DISTRO_BUILD: &str = "pipeline.handle_passed_distro_build";
pub const HANDLE_PRS: &str = "pipeline.handle_prs";
pub const REINDEX_CHANNELS: &str = "pipeline.reindex_conda_channels";
pub const CLEANUP_TASK_RESULTS: &str = "pipeline.cleanup_task_results";

/// Chains whose finished runs are purged by the cleanup job.
pub const NOISY_CHAINS: [&str; 2] = [REINDEX_CHANNELS, CLEANUP_TASK_RESULTS];

/// Handle to one dispatched build chain.
pub type BuildRun = JoinHandle<Result<Completed<BuildContext>>>;

/// Builds every chain once and dispatches them onto the worker pool.
pub struct Orchestrator {
    services: Arc<Services>,
    runner: ChainRunner,
    package_build: Arc<Chain<BuildConfig, BuildContext>>,
    staged_build: Arc<Chain<BuildConfig, BuildContext>>,
    passed_build: Arc<Chain<BuildConfig, BuildContext>>,
    handle_prs: Arc<Chain<EpochTarget, SweepContext>>,
    reindex: Arc<Chain<ReindexTarget, ()>>,
    cleanup: Arc<Chain<Retention, ()>>,
}

impl Orchestrator {
    pub fn new(services: Arc<Services>, pool: WorkerPool) -> Self {
        let s = &services;
        let package_build = Chain::new(NEW_PACKAGE_BUILD)
            .then(CreatePackageBuild(s.clone()))
            .then(FetchArtifact(s.clone()))
            .then(ReindexChannel(s.clone()))
            .then(MarkUploadedPackage(s.clone()))
            .then(VerifyArchitectures(s.clone()))
            .then(UpdateBuildConfig(s.clone()));

        let staged_build = Chain::new(NEW_DISTRO_BUILD)
            .then(GetOrCreateDistroBuild(s.clone()))
            .then(FetchArtifact(s.clone()))
            .then(MarkDistroGate(s.clone()))
            .then(VerifyArchitectures(s.clone()))
            .then(FindPackagesToCopy(s.clone()))
            .then(CopyPackages(s.clone()))
            .then(ReindexChannel(s.clone()))
            .then(MergeIntegrationPr(s.clone()));

        // Promotion reuses the staged binaries, nothing is fetched.
        let passed_build = Chain::new(PASSED_DISTRO_BUILD)
            .then(GetOrCreateDistroBuild(s.clone()))
            .then(MarkDistroGate(s.clone()))
            .then(VerifyArchitectures(s.clone()))
            .then(FindPackagesToCopy(s.clone()))
            .then(CopyPackages(s.clone()))
            .then(ReindexChannel(s.clone()));

        let handle_prs = Chain::new(HANDLE_PRS)
            .then(FindPackagesReadyForIntegration(s.clone()))
            .then(OpenPullRequest(s.clone()))
            .then(UpdateDistroBuildPrUrls(s.clone()));

        let reindex: Chain<ReindexTarget, ()> = Chain::new(REINDEX_CHANNELS).then(ReindexChannel(s.clone()));
        let cleanup = Chain::new(CLEANUP_TASK_RESULTS).then(PurgeTaskResults(s.clone()));

        Self {
            runner: ChainRunner::new(services.ledger.clone(), pool),
            package_build: Arc::new(package_build),
            staged_build: Arc::new(staged_build),
            passed_build: Arc::new(passed_build),
            handle_prs: Arc::new(handle_prs),
            reindex: Arc::new(reindex),
            cleanup: Arc::new(cleanup),
            services,
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn runner(&self) -> &ChainRunner {
        &self.runner
    }

    /// Step names of the named chain, in order.
    pub fn step_names(&self, chain: &str) -> Option<Vec<&'static str>> {
        match chain {
            NEW_PACKAGE_BUILD => Some(self.package_build.step_names()),
            NEW_DISTRO_BUILD => Some(self.staged_build.step_names()),
            PASSED_DISTRO_BUILD => Some(self.passed_build.step_names()),
            HANDLE_PRS => Some(self.handle_prs.step_names()),
            REINDEX_CHANNELS => Some(self.reindex.step_names()),
            CLEANUP_TASK_RESULTS => Some(self.cleanup.step_names()),
            _ => None,
        }
    }

    /// One package build chain per epoch, all dispatched after the delay.
    pub fn handle_new_package_build(
        &self,
        configs: Vec<PackageBuildConfig>,
    ) -> Group<Result<Completed<BuildContext>>> {
        let work = configs.into_iter().map(|cfg| {
            let config = BuildConfig::Package(cfg);
            let subject = format!("{}@{}", config.package_name(), config.epoch_name());
            let ctx = BuildContext::for_config(&config);
            self.launch(&self.package_build, subject, config, ctx)
        });
        self.runner
            .pool()
            .dispatch_group(self.services.settings.dispatch_delay, work)
    }

    /// Staged promotion of a distro build.
    pub fn handle_new_distro_build(&self, cfg: DistroBuildConfig) -> Result<BuildRun> {
        self.dispatch_distro(Gate::Staged, &self.staged_build, cfg)
    }

    /// Passed promotion of a distro build.
    pub fn handle_passed_distro_build(&self, cfg: DistroBuildConfig) -> Result<BuildRun> {
        self.dispatch_distro(Gate::Passed, &self.passed_build, cfg)
    }

    fn dispatch_distro(
        &self,
        gate: Gate,
        chain: &Arc<Chain<BuildConfig, BuildContext>>,
        cfg: DistroBuildConfig,
    ) -> Result<BuildRun> {
        let config = BuildConfig::Distro(cfg);
        if config.gate() != gate {
            return Err(library_core::ConfigError::InvalidGate(config.gate().to_string()).into());
        }
        let subject = config.channel_name();
        let ctx = BuildContext::for_config(&config);
        Ok(self.runner.pool().dispatch(
            self.services.settings.dispatch_delay,
            self.launch(chain, subject, config, ctx),
        ))
    }

    /// One PR sweep per (build target, epoch).
    pub async fn handle_prs(&self) -> Result<Group<Result<Completed<SweepContext>>>> {
        let mut work = Vec::new();
        for build_target in BuildTarget::ALL {
            for epoch in self.services.store.epochs_by_build_target(build_target).await? {
                let ctx = SweepContext::new(epoch.name.clone(), self.services.settings.github_token.clone());
                let target = EpochTarget {
                    build_target,
                    epoch_name: epoch.name.clone(),
                };
                work.push(self.launch(&self.handle_prs, epoch.name, target, ctx));
            }
        }
        info!(sweeps = work.len(), "dispatching pr sweeps");
        Ok(self.runner.pool().dispatch_group(Duration::ZERO, work))
    }

    /// Reindex every epoch's tested channel and each of its distros' staged channel.
    pub async fn reindex_channels(&self) -> Result<Group<Result<Completed<()>>>> {
        let mut work = Vec::new();
        for target in self.reindex_targets().await? {
            let subject = target.channel_name.clone();
            work.push(self.launch(&self.reindex, subject, target, ()));
        }
        Ok(self.runner.pool().dispatch_group(Duration::ZERO, work))
    }

    async fn reindex_targets(&self) -> Result<Vec<ReindexTarget>> {
        let store = &self.services.store;
        let settings = &self.services.settings;

        let mut epochs: Vec<EpochRecord> = Vec::new();
        for build_target in BuildTarget::ALL {
            epochs.extend(store.epochs_by_build_target(build_target).await?);
        }

        let mut targets = Vec::new();
        for epoch in epochs {
            targets.push(ReindexTarget {
                channel: settings.tested_channel(&epoch.name),
                channel_name: format!("{}-{}", epoch.name, Gate::Tested),
            });
            for distro in store.distros_in_epoch(&epoch.id).await? {
                targets.push(ReindexTarget {
                    channel: settings.distro_channel(&epoch.name, Gate::Staged.as_str(), &distro.name),
                    channel_name: format!("{}-{}-{}", epoch.name, distro.name, Gate::Staged),
                });
            }
        }
        Ok(targets)
    }

    /// Purge finished noisy runs older than the retention window.
    pub fn cleanup_task_results(&self) -> JoinHandle<Result<Completed<()>>> {
        let retention = Retention {
            chains: NOISY_CHAINS.to_vec(),
            cutoff: cutoff(self.services.settings.task_result_retention),
        };
        let subject = retention.cutoff.to_rfc3339();
        self.runner
            .pool()
            .dispatch(Duration::ZERO, self.launch(&self.cleanup, subject, retention, ()))
    }

    fn launch<C, X>(
        &self,
        chain: &Arc<Chain<C, X>>,
        subject: String,
        config: C,
        ctx: X,
    ) -> impl Future<Output = Result<Completed<X>>> + Send + 'static
    where
        C: Send + Sync + 'static,
        X: ChainContext,
    {
        let runner = self.runner.clone();
        let chain = chain.clone();
        async move { runner.run(&chain, &subject, &config, ctx).await }
    }
}

fn cutoff(retention: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|r| Utc::now().checked_sub_signed(r))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cutoff_is_in_the_past() {
        let now = Utc::now();
        let c = cutoff(Duration::from_secs(24 * 60 * 60));
        assert!(c < now);
        assert!(now - c >= chrono::Duration::hours(24));
    }

    #[test]
    fn test_noisy_chains_are_periodic_housekeeping() {
        assert!(NOISY_CHAINS.contains(&REINDEX_CHANNELS));
        assert!(!NOISY_CHAINS.contains(&HANDLE_PRS));
    }
}
