//! Inbound triggers.
//!
//! A trigger either rejects synchronously or dispatches its chains and
//! returns at once. Chain failures never reach the caller; they are only
//! visible in the task ledger.

use library_core::{
    BuildContext, ConfigError, DistroBuildConfig, DistroBuildRequest, PackageBuildConfig,
    PackageBuildRequest,
};
use library_state::{Gate, StorageError};
use tracing::{info, warn};

use crate::chain::Completed;
use crate::chains::{BuildRun, Orchestrator};
use crate::error::{PipelineError, Result};
use crate::queue::Group;

impl Orchestrator {
    /// Accept a package build callback: one chain per epoch of its build target.
    ///
    /// The chains run whether or not the returned group is joined.
    pub async fn accept_package_build(
        &self,
        request: &PackageBuildRequest,
    ) -> Result<Group<Result<Completed<BuildContext>>>> {
        let services = self.services();
        match services.store.package_by_token(&request.token).await {
            Ok(_) => {}
            Err(StorageError::UnknownPackageToken) => {
                warn!(package = %request.package_name, "package build rejected: unknown token");
                return Err(PipelineError::Unauthorized("unknown package token"));
            }
            Err(e) => return Err(e.into()),
        }

        let epochs = services
            .store
            .epochs_by_build_target(request.build_target)
            .await?;
        let configs = epochs
            .iter()
            .map(|epoch| PackageBuildConfig::new(&services.settings, request, &epoch.name))
            .collect::<std::result::Result<Vec<_>, ConfigError>>()?;

        info!(
            package = %request.package_name,
            version = %request.version,
            artifact = %request.artifact_name,
            build_target = %request.build_target,
            epochs = configs.len(),
            "package build accepted"
        );
        Ok(self.handle_new_package_build(configs))
    }

    /// Accept a distro promotion callback for `gate` (`staged` or `passed`).
    pub fn accept_distro_build(&self, request: &DistroBuildRequest, gate: Gate) -> Result<BuildRun> {
        let settings = &self.services().settings;
        let expected = &settings.integration_repo.token;
        if expected.is_empty() || request.token != *expected {
            warn!(distro = %request.distro_name, gate = %gate, "distro build rejected: token mismatch");
            return Err(PipelineError::Unauthorized("integration token mismatch"));
        }

        let cfg = DistroBuildConfig::new(settings, request, gate)?;
        info!(
            distro = %request.distro_name,
            epoch = %request.epoch_name,
            version = %request.version,
            gate = %gate,
            pr = ?request.pr_number,
            "distro build accepted"
        );
        match gate {
            Gate::Passed => self.handle_passed_distro_build(cfg),
            _ => self.handle_new_distro_build(cfg),
        }
    }
}
