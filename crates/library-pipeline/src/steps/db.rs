//! Steps on the `db` queue: build records and task results.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use library_core::{resolve, BuildConfig, BuildContext, BuildKind, SweepContext};
use library_state::{Arch, DistroBuildKey, PackageBuildKey};
use tracing::{debug, info};

use super::{distro_config, package_config, record_id, EpochTarget, Retention, Services};
use crate::chain::Step;
use crate::error::Result;
use crate::queue::Queue;

/// Sync the package from the trigger and get-or-create its build record.
pub struct CreatePackageBuild(pub Arc<Services>);

#[async_trait]
impl Step<BuildConfig, BuildContext> for CreatePackageBuild {
    fn name(&self) -> &'static str {
        "db.create_package_build_record_and_update_package"
    }

    fn queue(&self) -> Queue {
        Queue::Db
    }

    async fn run(&self, mut ctx: BuildContext, config: &BuildConfig) -> Result<BuildContext> {
        let cfg = package_config(self.name(), config)?;
        let store = &self.0.store;

        let package = store.package_by_token(cfg.package_token()).await?;
        let package = store
            .sync_package(&package.id, config.package_name(), &config.repository())
            .await?;
        let epoch = store.epoch_by_name(config.epoch_name()).await?;

        let build = store
            .get_or_create_package_build(PackageBuildKey {
                package_id: package.id,
                epoch_id: epoch.id,
                run_id: config.run_id().to_string(),
                version: cfg.version().to_string(),
                build_target: cfg.build_target(),
            })
            .await?;

        debug!(package = %package.name, build = %build.id, epoch = %epoch.name, "package build record ready");
        ctx.record_id = Some(build.id);
        Ok(ctx)
    }
}

/// Get-or-create the distro build of a promotion and stamp the gate's run id.
pub struct GetOrCreateDistroBuild(pub Arc<Services>);

#[async_trait]
impl Step<BuildConfig, BuildContext> for GetOrCreateDistroBuild {
    fn name(&self) -> &'static str {
        "db.update_distro_build_record"
    }

    fn queue(&self) -> Queue {
        Queue::Db
    }

    async fn run(&self, mut ctx: BuildContext, config: &BuildConfig) -> Result<BuildContext> {
        let cfg = distro_config(self.name(), config)?;
        let store = &self.0.store;

        // A PR opened by hand has no sweep placeholder, so the record may be new.
        let distro = store.distro_by_name(cfg.distro_name()).await?;
        let epoch = store.epoch_by_name(config.epoch_name()).await?;
        let record = store
            .get_or_create_distro_build(DistroBuildKey {
                distro_id: distro.id,
                epoch_id: epoch.id,
                version: cfg.version().to_string(),
            })
            .await?;
        let record = store
            .stamp_distro_run(&record.id, config.gate(), config.run_id())
            .await?;

        ctx.record_id = Some(record.id);
        Ok(ctx)
    }
}

/// Set the architecture flag named by a package artifact.
///
/// Only that flag is written, so the other architecture's chain running
/// alongside never loses its mark.
pub struct MarkUploadedPackage(pub Arc<Services>);

#[async_trait]
impl Step<BuildConfig, BuildContext> for MarkUploadedPackage {
    fn name(&self) -> &'static str {
        "db.mark_uploaded_package"
    }

    fn queue(&self) -> Queue {
        Queue::Db
    }

    async fn run(&self, ctx: BuildContext, config: &BuildConfig) -> Result<BuildContext> {
        package_config(self.name(), config)?;
        let store = &self.0.store;

        let arch = Arch::from_package_artifact(config.artifact_name())?;
        let build = store
            .mark_package_architecture(&record_id(&ctx)?, arch)
            .await?;

        info!(build = %build.id, arch = arch.subdir(), "architecture uploaded");
        Ok(ctx)
    }
}

/// Set the gate flag named by a distro artifact.
pub struct MarkDistroGate(pub Arc<Services>);

#[async_trait]
impl Step<BuildConfig, BuildContext> for MarkDistroGate {
    fn name(&self) -> &'static str {
        "db.mark_distro_gate"
    }

    fn queue(&self) -> Queue {
        Queue::Db
    }

    async fn run(&self, ctx: BuildContext, config: &BuildConfig) -> Result<BuildContext> {
        distro_config(self.name(), config)?;
        let store = &self.0.store;

        let id = record_id(&ctx)?;
        let arch = store
            .get_distro_build(&id)
            .await?
            .gate_architecture(config.gate(), config.artifact_name())?;
        let build = store
            .mark_distro_architecture(&id, config.gate(), arch)
            .await?;

        info!(build = %build.id, gate = %config.gate(), arch = arch.subdir(), "distro gate marked");
        Ok(ctx)
    }
}

/// Clear the context's missing-architectures flag once the gate verifies.
pub struct VerifyArchitectures(pub Arc<Services>);

#[async_trait]
impl Step<BuildConfig, BuildContext> for VerifyArchitectures {
    fn name(&self) -> &'static str {
        "db.verify_all_architectures_present"
    }

    fn queue(&self) -> Queue {
        Queue::Db
    }

    async fn run(&self, mut ctx: BuildContext, config: &BuildConfig) -> Result<BuildContext> {
        let id = record_id(&ctx)?;
        let gate = config.gate();
        let complete = match ctx.kind {
            BuildKind::Package => self.0.store.get_package_build(&id).await?.verify_gate(gate)?,
            BuildKind::Distro => self.0.store.get_distro_build(&id).await?.verify_gate(gate)?,
        };

        if complete {
            ctx.missing_architectures = false;
        } else {
            info!(build = %id, gate = %gate, "waiting on remaining architectures");
        }
        Ok(ctx)
    }
}

/// Resolve one epoch's ready package builds and create a placeholder distro
/// build per distro that has any.
pub struct FindPackagesReadyForIntegration(pub Arc<Services>);

#[async_trait]
impl Step<EpochTarget, SweepContext> for FindPackagesReadyForIntegration {
    fn name(&self) -> &'static str {
        "db.find_packages_ready_for_integration"
    }

    fn queue(&self) -> Queue {
        Queue::Db
    }

    async fn run(&self, mut ctx: SweepContext, config: &EpochTarget) -> Result<SweepContext> {
        let store = &self.0.store;
        let epoch = store.epoch_by_name(&config.epoch_name).await?;

        let mut candidates = BTreeMap::new();
        for distro in store.list_distros().await? {
            let ready = store.ready_for_integration(&epoch.name, &distro).await?;
            if ready.is_empty() {
                continue;
            }

            let version = Utc::now().format("%Y.%m.%d.%H.%M.%S").to_string();
            let placeholder = store
                .get_or_create_distro_build(DistroBuildKey {
                    distro_id: distro.id,
                    epoch_id: epoch.id,
                    version,
                })
                .await?;
            let ids: Vec<_> = ready.iter().map(|b| b.id).collect();
            let placeholder = store.attach_package_builds(&placeholder.id, &ids).await?;

            debug!(distro = %distro.name, candidates = ready.len(), placeholder = %placeholder.id, "distro has ready builds");
            ctx.distro_build_ids.insert(distro.name.clone(), placeholder.id);
            candidates.insert(distro.name, ready);
        }

        let plan = resolve(&candidates)?;
        info!(
            epoch = %epoch.name,
            build_target = %config.build_target,
            distros = plan.package_versions.len(),
            builds = plan.package_build_ids.len(),
            "integration candidates resolved"
        );
        ctx.package_versions = plan.package_versions;
        ctx.package_build_ids = plan.package_build_ids;
        Ok(ctx)
    }
}

/// Record the sweep's PR url on every placeholder it created.
///
/// A placeholder that already has a url means two sweeps raced, which is a
/// conflict rather than something to merge.
pub struct UpdateDistroBuildPrUrls(pub Arc<Services>);

#[async_trait]
impl Step<EpochTarget, SweepContext> for UpdateDistroBuildPrUrls {
    fn name(&self) -> &'static str {
        "db.update_distro_build_record_integration_pr_url"
    }

    fn queue(&self) -> Queue {
        Queue::Db
    }

    async fn run(&self, ctx: SweepContext, _config: &EpochTarget) -> Result<SweepContext> {
        let Some(pr_url) = ctx.pr_url.as_deref().filter(|_| ctx.ready_to_update_distro_builds()) else {
            return Ok(ctx);
        };

        let store = &self.0.store;
        for (distro, id) in &ctx.distro_build_ids {
            store.set_distro_pr_url(id, pr_url).await?;
            debug!(distro = %distro, build = %id, "pr url recorded");
        }
        Ok(ctx)
    }
}

/// Delete old finished runs of noisy chains from the task ledger.
pub struct PurgeTaskResults(pub Arc<Services>);

#[async_trait]
impl Step<Retention, ()> for PurgeTaskResults {
    fn name(&self) -> &'static str {
        "db.purge_task_results"
    }

    fn queue(&self) -> Queue {
        Queue::Db
    }

    async fn run(&self, ctx: (), config: &Retention) -> Result<()> {
        let purged = self
            .0
            .ledger
            .purge_finished(&config.chains, config.cutoff)
            .await?;
        info!(purged, cutoff = %config.cutoff, "task results purged");
        Ok(ctx)
    }
}
