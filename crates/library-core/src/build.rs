//! Build configurations and the contexts threaded through task chains.
//!
//! A config is computed once from a trigger and never changes; its derived
//! fields (`gate`, `to_channel`, `from_channel`, `pr_url`) are fixed at
//! construction. A context is the small mutable accumulator each step
//! receives and returns.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use library_state::{BuildTarget, Gate, RecordId};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::resolver::PackageVersions;
use crate::settings::Settings;

fn required<'a>(value: &'a str, field: &'static str) -> Result<&'a str, ConfigError> {
    if value.trim().is_empty() {
        Err(ConfigError::Missing(field))
    } else {
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Payload of the package-build-ready trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageBuildRequest {
    pub token: String,
    pub run_id: String,
    pub version: String,
    pub package_name: String,
    /// `owner/repo` of the package's CI project.
    pub repository: String,
    pub artifact_name: String,
    #[serde(default)]
    pub build_target: BuildTarget,
}

/// Payload of the distro promotion trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistroBuildRequest {
    pub token: String,
    pub version: String,
    pub run_id: String,
    pub distro_name: String,
    pub epoch_name: String,
    pub artifact_name: String,
    #[serde(default)]
    pub pr_number: Option<u64>,
    #[serde(default)]
    pub package_versions: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Configs
// ---------------------------------------------------------------------------

/// One package build published into one epoch's tested channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageBuildConfig {
    github_token: String,
    run_id: String,
    artifact_name: String,
    package_name: String,
    version: String,
    repository: String,
    build_target: BuildTarget,
    package_token: String,
    epoch_name: String,
    to_channel: PathBuf,
}

impl PackageBuildConfig {
    pub fn new(
        settings: &Settings,
        request: &PackageBuildRequest,
        epoch_name: &str,
    ) -> Result<Self, ConfigError> {
        let epoch_name = required(epoch_name, "epoch_name")?;
        Ok(Self {
            github_token: settings.github_token.clone(),
            run_id: required(&request.run_id, "run_id")?.to_string(),
            artifact_name: required(&request.artifact_name, "artifact_name")?.to_string(),
            package_name: required(&request.package_name, "package_name")?.to_string(),
            version: required(&request.version, "version")?.to_string(),
            repository: request.repository.clone(),
            build_target: request.build_target,
            package_token: request.token.clone(),
            epoch_name: epoch_name.to_string(),
            to_channel: settings.tested_channel(epoch_name),
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn build_target(&self) -> BuildTarget {
        self.build_target
    }

    pub fn package_token(&self) -> &str {
        &self.package_token
    }

    /// `<epoch>-tested`
    pub fn channel_name(&self) -> String {
        format!("{}-{}", self.epoch_name, Gate::Tested)
    }
}

/// One distro promotion (staged or passed) within an epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DistroBuildConfig {
    github_token: String,
    run_id: String,
    artifact_name: String,
    distro_name: String,
    version: String,
    epoch_name: String,
    owner: String,
    repo: String,
    gate: Gate,
    from_channel: PathBuf,
    to_channel: PathBuf,
    package_versions: BTreeMap<String, String>,
    pr_number: Option<u64>,
    pr_url: String,
}

impl DistroBuildConfig {
    /// Only `staged` and `passed` are promotion gates.
    ///
    /// Staged promotions copy from the epoch's tested channel, passed
    /// promotions from the distro's staged channel.
    pub fn new(
        settings: &Settings,
        request: &DistroBuildRequest,
        gate: Gate,
    ) -> Result<Self, ConfigError> {
        let epoch = required(&request.epoch_name, "epoch_name")?;
        let distro = required(&request.distro_name, "distro_name")?;
        let from_channel = match gate {
            Gate::Staged => settings.tested_channel(epoch),
            Gate::Passed => settings.distro_channel(epoch, Gate::Staged.as_str(), distro),
            Gate::Tested => return Err(ConfigError::InvalidGate(gate.to_string())),
        };
        let repo = &settings.integration_repo;

        Ok(Self {
            github_token: settings.github_token.clone(),
            run_id: required(&request.run_id, "run_id")?.to_string(),
            artifact_name: required(&request.artifact_name, "artifact_name")?.to_string(),
            distro_name: distro.to_string(),
            version: required(&request.version, "version")?.to_string(),
            epoch_name: epoch.to_string(),
            owner: repo.owner.clone(),
            repo: repo.repo.clone(),
            gate,
            from_channel,
            to_channel: settings.distro_channel(epoch, gate.as_str(), distro),
            package_versions: request.package_versions.clone(),
            pr_number: request.pr_number,
            pr_url: request.pr_number.map(|n| repo.pr_url(n)).unwrap_or_default(),
        })
    }

    pub fn distro_name(&self) -> &str {
        &self.distro_name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn from_channel(&self) -> &Path {
        &self.from_channel
    }

    pub fn package_versions(&self) -> &BTreeMap<String, String> {
        &self.package_versions
    }

    pub fn pr_number(&self) -> Option<u64> {
        self.pr_number
    }

    /// Empty when no PR number was supplied.
    pub fn pr_url(&self) -> &str {
        &self.pr_url
    }

    /// `<epoch>-<distro>-<gate>`
    pub fn channel_name(&self) -> String {
        format!("{}-{}-{}", self.epoch_name, self.distro_name, self.gate)
    }
}

/// Which record a chain works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildKind {
    Package,
    Distro,
}

/// Immutable configuration of one build chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildConfig {
    Package(PackageBuildConfig),
    Distro(DistroBuildConfig),
}

impl BuildConfig {
    pub fn kind(&self) -> BuildKind {
        match self {
            BuildConfig::Package(_) => BuildKind::Package,
            BuildConfig::Distro(_) => BuildKind::Distro,
        }
    }

    pub fn github_token(&self) -> &str {
        match self {
            BuildConfig::Package(c) => &c.github_token,
            BuildConfig::Distro(c) => &c.github_token,
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            BuildConfig::Package(c) => &c.run_id,
            BuildConfig::Distro(c) => &c.run_id,
        }
    }

    pub fn artifact_name(&self) -> &str {
        match self {
            BuildConfig::Package(c) => &c.artifact_name,
            BuildConfig::Distro(c) => &c.artifact_name,
        }
    }

    /// Package name, or the distro name for distro builds.
    pub fn package_name(&self) -> &str {
        match self {
            BuildConfig::Package(c) => &c.package_name,
            BuildConfig::Distro(c) => &c.distro_name,
        }
    }

    /// `owner/repo` whose CI produced the artifact.
    pub fn repository(&self) -> String {
        match self {
            BuildConfig::Package(c) => c.repository.clone(),
            BuildConfig::Distro(c) => format!("{}/{}", c.owner, c.repo),
        }
    }

    pub fn epoch_name(&self) -> &str {
        match self {
            BuildConfig::Package(c) => &c.epoch_name,
            BuildConfig::Distro(c) => &c.epoch_name,
        }
    }

    pub fn gate(&self) -> Gate {
        match self {
            BuildConfig::Package(_) => Gate::Tested,
            BuildConfig::Distro(c) => c.gate,
        }
    }

    pub fn to_channel(&self) -> &Path {
        match self {
            BuildConfig::Package(c) => &c.to_channel,
            BuildConfig::Distro(c) => &c.to_channel,
        }
    }

    pub fn channel_name(&self) -> String {
        match self {
            BuildConfig::Package(c) => c.channel_name(),
            BuildConfig::Distro(c) => c.channel_name(),
        }
    }

    pub fn as_package(&self) -> Option<&PackageBuildConfig> {
        match self {
            BuildConfig::Package(c) => Some(c),
            BuildConfig::Distro(_) => None,
        }
    }

    pub fn as_distro(&self) -> Option<&DistroBuildConfig> {
        match self {
            BuildConfig::Distro(c) => Some(c),
            BuildConfig::Package(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Contexts
// ---------------------------------------------------------------------------

/// Mutable state threaded through a package or distro chain.
///
/// Holds only what later steps need to re-fetch the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildContext {
    pub kind: BuildKind,
    pub record_id: Option<RecordId>,
    /// Starts `true`; cleared once the gate verifies.
    pub missing_architectures: bool,
    /// Channel-relative paths (`<arch>/<file>`) to promote.
    pub package_files: Vec<PathBuf>,
}

impl BuildContext {
    pub fn new(kind: BuildKind) -> Self {
        Self {
            kind,
            record_id: None,
            missing_architectures: true,
            package_files: Vec::new(),
        }
    }

    pub fn for_config(config: &BuildConfig) -> Self {
        Self::new(config.kind())
    }
}

/// Cross-distro state of one epoch's PR sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepContext {
    pub epoch_name: String,
    pub github_token: String,
    pub package_versions: PackageVersions,
    pub package_build_ids: BTreeSet<RecordId>,
    /// distro name → placeholder distro build created by this sweep
    pub distro_build_ids: BTreeMap<String, RecordId>,
    pub branch: Option<String>,
    pub pr_url: Option<String>,
}

impl SweepContext {
    pub fn new(epoch_name: impl Into<String>, github_token: impl Into<String>) -> Self {
        Self {
            epoch_name: epoch_name.into(),
            github_token: github_token.into(),
            ..Self::default()
        }
    }

    pub fn ready_to_open_pr(&self) -> bool {
        !self.package_versions.is_empty()
    }

    pub fn ready_to_update_distro_builds(&self) -> bool {
        !self.distro_build_ids.is_empty() && self.pr_url.as_deref().is_some_and(|u| !u.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::IntegrationRepo;

    fn settings() -> Settings {
        Settings::default()
            .with_channel_root("/srv/conda")
            .with_github_token("gh-token")
            .with_integration_repo(IntegrationRepo {
                owner: "qiime2".to_string(),
                repo: "package-integration".to_string(),
                main_branch: "main".to_string(),
                token: "secret".to_string(),
            })
    }

    fn package_request() -> PackageBuildRequest {
        PackageBuildRequest {
            token: "pkg-token".to_string(),
            run_id: "1001".to_string(),
            version: "2024.10.0.dev0".to_string(),
            package_name: "q2-types".to_string(),
            repository: "qiime2/q2-types".to_string(),
            artifact_name: "linux-64".to_string(),
            build_target: BuildTarget::Dev,
        }
    }

    fn distro_request(pr_number: Option<u64>) -> DistroBuildRequest {
        DistroBuildRequest {
            token: "secret".to_string(),
            version: "2024.10.01.10.00.00".to_string(),
            run_id: "2002".to_string(),
            distro_name: "core".to_string(),
            epoch_name: "2024.10".to_string(),
            artifact_name: "core-linux".to_string(),
            pr_number,
            package_versions: BTreeMap::new(),
        }
    }

    #[test]
    fn test_package_config_targets_tested_channel() {
        let cfg = BuildConfig::Package(
            PackageBuildConfig::new(&settings(), &package_request(), "2024.10").unwrap(),
        );
        assert_eq!(cfg.gate(), Gate::Tested);
        assert_eq!(cfg.to_channel(), Path::new("/srv/conda/2024.10/tested"));
        assert_eq!(cfg.channel_name(), "2024.10-tested");
        assert_eq!(cfg.repository(), "qiime2/q2-types");
        assert_eq!(cfg.github_token(), "gh-token");
    }

    #[test]
    fn test_staged_config_copies_from_tested() {
        let cfg = DistroBuildConfig::new(&settings(), &distro_request(Some(7)), Gate::Staged).unwrap();
        assert_eq!(cfg.from_channel(), Path::new("/srv/conda/2024.10/tested"));
        assert_eq!(
            BuildConfig::Distro(cfg.clone()).to_channel(),
            Path::new("/srv/conda/2024.10/staged/core")
        );
        assert_eq!(cfg.pr_url(), "https://github.com/qiime2/package-integration/pull/7");
        assert_eq!(cfg.channel_name(), "2024.10-core-staged");
    }

    #[test]
    fn test_passed_config_copies_from_staged() {
        let cfg = DistroBuildConfig::new(&settings(), &distro_request(None), Gate::Passed).unwrap();
        assert_eq!(cfg.from_channel(), Path::new("/srv/conda/2024.10/staged/core"));
        assert_eq!(cfg.pr_url(), "");
        let cfg = BuildConfig::Distro(cfg);
        assert_eq!(cfg.package_name(), "core");
        assert_eq!(cfg.repository(), "qiime2/package-integration");
    }

    #[test]
    fn test_distro_config_rejects_tested_gate() {
        let err = DistroBuildConfig::new(&settings(), &distro_request(None), Gate::Tested).unwrap_err();
        assert_eq!(err, ConfigError::InvalidGate("tested".to_string()));
    }

    #[test]
    fn test_missing_fields_are_rejected() {
        let mut request = package_request();
        request.run_id = String::new();
        assert_eq!(
            PackageBuildConfig::new(&settings(), &request, "2024.10").unwrap_err(),
            ConfigError::Missing("run_id")
        );
    }

    #[test]
    fn test_new_context_assumes_missing_architectures() {
        let ctx = BuildContext::new(BuildKind::Distro);
        assert!(ctx.missing_architectures);
        assert!(ctx.record_id.is_none());
    }

    #[test]
    fn test_sweep_readiness() {
        let mut ctx = SweepContext::new("2024.10", "gh-token");
        assert!(!ctx.ready_to_open_pr());

        ctx.package_versions
            .entry("core".to_string())
            .or_default()
            .insert("q2-types".to_string(), "1.0".to_string());
        assert!(ctx.ready_to_open_pr());
        assert!(!ctx.ready_to_update_distro_builds());

        ctx.distro_build_ids.insert("core".to_string(), RecordId::new());
        ctx.pr_url = Some("https://github.com/o/r/pull/1".to_string());
        assert!(ctx.ready_to_update_distro_builds());
    }

    #[test]
    fn test_request_build_target_defaults_to_dev() {
        let request: PackageBuildRequest = serde_json::from_value(serde_json::json!({
            "token": "t",
            "run_id": "1",
            "version": "1.0",
            "package_name": "q2-types",
            "repository": "qiime2/q2-types",
            "artifact_name": "osx-64"
        }))
        .unwrap();
        assert_eq!(request.build_target, BuildTarget::Dev);
    }
}
