//! Steps on the `git` queue: integration recipes and pull requests.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use library_core::{BuildConfig, BuildContext, SweepContext};
use library_github::integration_pr_body;
use library_state::Gate;
use tracing::{info, warn};

use super::{distro_config, package_config, EpochTarget, Services};
use crate::chain::Step;
use crate::error::Result;
use crate::queue::Queue;
use crate::retry::RetryPolicy;

/// Record a fully tested package version in the epoch's build configuration.
pub struct UpdateBuildConfig(pub Arc<Services>);

#[async_trait]
impl Step<BuildConfig, BuildContext> for UpdateBuildConfig {
    fn name(&self) -> &'static str {
        "git.update_conda_build_config"
    }

    fn queue(&self) -> Queue {
        Queue::Git
    }

    fn retry(&self) -> RetryPolicy {
        RetryPolicy::git(&self.0.settings)
    }

    fn gated(&self) -> bool {
        true
    }

    async fn run(&self, ctx: BuildContext, config: &BuildConfig) -> Result<BuildContext> {
        let cfg = package_config(self.name(), config)?;
        let versions = BTreeMap::from([(config.package_name().to_string(), cfg.version().to_string())]);

        self.0
            .recipes
            .update_build_config(
                &self.0.settings.integration_repo.main_branch,
                config.epoch_name(),
                config.gate(),
                None,
                &versions,
            )
            .await?;
        Ok(ctx)
    }
}

/// Merge the integration PR a staged promotion was built from.
pub struct MergeIntegrationPr(pub Arc<Services>);

#[async_trait]
impl Step<BuildConfig, BuildContext> for MergeIntegrationPr {
    fn name(&self) -> &'static str {
        "git.merge_integration_pr"
    }

    fn queue(&self) -> Queue {
        Queue::Git
    }

    fn retry(&self) -> RetryPolicy {
        RetryPolicy::git(&self.0.settings)
    }

    fn gated(&self) -> bool {
        true
    }

    async fn run(&self, ctx: BuildContext, config: &BuildConfig) -> Result<BuildContext> {
        let cfg = distro_config(self.name(), config)?;
        match cfg.pr_number() {
            Some(number) => self.0.recipes.merge_pr(number).await?,
            None => warn!(distro = cfg.distro_name(), version = cfg.version(), "no integration pr to merge"),
        }
        Ok(ctx)
    }
}

/// Write the sweep's versions to a fresh branch and open one PR for the epoch.
pub struct OpenPullRequest(pub Arc<Services>);

#[async_trait]
impl Step<EpochTarget, SweepContext> for OpenPullRequest {
    fn name(&self) -> &'static str {
        "git.open_pull_request"
    }

    fn queue(&self) -> Queue {
        Queue::Git
    }

    fn retry(&self) -> RetryPolicy {
        RetryPolicy::git(&self.0.settings)
    }

    async fn run(&self, mut ctx: SweepContext, _config: &EpochTarget) -> Result<SweepContext> {
        if !ctx.ready_to_open_pr() {
            return Ok(ctx);
        }

        let recipes = &self.0.recipes;
        let branch = uuid::Uuid::new_v4().to_string();
        recipes
            .update_integration(&branch, &ctx.epoch_name, Gate::Staged, &ctx.package_versions)
            .await?;

        let title = format!("{} {}", ctx.epoch_name, Gate::Staged);
        let body = integration_pr_body(&ctx.package_versions)?;
        let pr_url = recipes.open_pr(&branch, &title, &body).await?;

        info!(epoch = %ctx.epoch_name, branch = %branch, pr_url = %pr_url, "integration pr opened");
        ctx.branch = Some(branch);
        ctx.pr_url = Some(pr_url);
        Ok(ctx)
    }
}
