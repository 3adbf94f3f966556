//! Steps on the `packages` queue: artifact downloads and channel files.

use std::sync::Arc;

use async_trait::async_trait;
use library_core::channel::{copy_files, find_package_files};
use library_core::{BuildConfig, BuildContext};
use library_github::ArtifactRequest;
use tracing::{debug, info};

use super::{distro_config, ReindexTarget, Services};
use crate::chain::Step;
use crate::error::Result;
use crate::queue::Queue;
use crate::retry::RetryPolicy;

/// Download the run's artifact and copy its package files into `to_channel`.
pub struct FetchArtifact(pub Arc<Services>);

#[async_trait]
impl Step<BuildConfig, BuildContext> for FetchArtifact {
    fn name(&self) -> &'static str {
        "packages.fetch_package_from_github"
    }

    fn queue(&self) -> Queue {
        Queue::Packages
    }

    fn retry(&self) -> RetryPolicy {
        RetryPolicy::artifact(&self.0.settings)
    }

    async fn run(&self, ctx: BuildContext, config: &BuildConfig) -> Result<BuildContext> {
        let request = ArtifactRequest::from_config(config);
        let copied = self
            .0
            .artifacts
            .sync(&request, config.package_name(), config.to_channel())
            .await?;
        info!(
            artifact = %request.artifact_name,
            channel = %config.to_channel().display(),
            files = copied.len(),
            "artifact synced into channel"
        );
        Ok(ctx)
    }
}

/// Locate the files of the promotion's package versions in `from_channel`.
pub struct FindPackagesToCopy(pub Arc<Services>);

#[async_trait]
impl Step<BuildConfig, BuildContext> for FindPackagesToCopy {
    fn name(&self) -> &'static str {
        "packages.find_packages_to_copy"
    }

    fn queue(&self) -> Queue {
        Queue::Packages
    }

    fn gated(&self) -> bool {
        true
    }

    async fn run(&self, mut ctx: BuildContext, config: &BuildConfig) -> Result<BuildContext> {
        let cfg = distro_config(self.name(), config)?;
        ctx.package_files = find_package_files(cfg.from_channel(), cfg.package_versions()).await?;
        debug!(files = ctx.package_files.len(), from = %cfg.from_channel().display(), "package files to copy");
        Ok(ctx)
    }
}

/// Copy the files found by [`FindPackagesToCopy`] into `to_channel`.
pub struct CopyPackages(pub Arc<Services>);

#[async_trait]
impl Step<BuildConfig, BuildContext> for CopyPackages {
    fn name(&self) -> &'static str {
        "packages.copy_conda_packages"
    }

    fn queue(&self) -> Queue {
        Queue::Packages
    }

    fn gated(&self) -> bool {
        true
    }

    async fn run(&self, ctx: BuildContext, config: &BuildConfig) -> Result<BuildContext> {
        let cfg = distro_config(self.name(), config)?;
        let copied = copy_files(cfg.from_channel(), config.to_channel(), &ctx.package_files).await?;
        info!(copied, to = %config.to_channel().display(), "package files promoted");
        Ok(ctx)
    }
}

/// Bootstrap a channel and regenerate its index.
pub struct ReindexChannel(pub Arc<Services>);

impl ReindexChannel {
    const NAME: &'static str = "packages.reindex_conda_channel";
}

#[async_trait]
impl Step<BuildConfig, BuildContext> for ReindexChannel {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn queue(&self) -> Queue {
        Queue::Packages
    }

    async fn run(&self, ctx: BuildContext, config: &BuildConfig) -> Result<BuildContext> {
        self.0
            .indexer
            .reindex(config.to_channel(), &config.channel_name())
            .await?;
        Ok(ctx)
    }
}

#[async_trait]
impl Step<ReindexTarget, ()> for ReindexChannel {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn queue(&self) -> Queue {
        Queue::Packages
    }

    async fn run(&self, ctx: (), config: &ReindexTarget) -> Result<()> {
        self.0
            .indexer
            .reindex(&config.channel, &config.channel_name)
            .await?;
        Ok(ctx)
    }
}
