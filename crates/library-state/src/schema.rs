//! Entity records for packages, epochs, distros and their builds.
//!
//! Records are plain data. Persisted shape and invariants belong here, the
//! storage backend only decides where they live.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Primary key shared by every entity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub Uuid);

impl RecordId {
    /// Generate a new random id.
    pub fn new() -> Self {
        RecordId(Uuid::new_v4())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(RecordId(Uuid::parse_str(s)?))
    }
}

/// Which family of epochs a package build is published into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BuildTarget {
    #[default]
    Dev,
    Release,
}

impl BuildTarget {
    pub const ALL: [BuildTarget; 2] = [BuildTarget::Dev, BuildTarget::Release];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildTarget::Dev => "dev",
            BuildTarget::Release => "release",
        }
    }
}

impl std::fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildTarget {
    type Err = String;

    /// Empty input falls back to `dev`, matching the trigger default.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "dev" => Ok(BuildTarget::Dev),
            "release" => Ok(BuildTarget::Release),
            other => Err(format!("unknown build target: {other}")),
        }
    }
}

/// An external CI project registered with the library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub id: RecordId,
    /// Empty until the first build reports it.
    pub name: String,
    /// Registration token binding the CI project to this record.
    pub token: String,
    /// `owner/repo` of the source repository.
    pub repository: String,
}

impl PackageRecord {
    /// Register a new package with a freshly minted token.
    pub fn register() -> Self {
        Self {
            id: RecordId::new(),
            name: String::new(),
            token: Uuid::new_v4().to_string(),
            repository: String::new(),
        }
    }
}

/// A named release line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub id: RecordId,
    pub name: String,
    pub is_dev: bool,
    pub include_in_ci: bool,
}

impl EpochRecord {
    pub fn new(name: impl Into<String>, is_dev: bool, include_in_ci: bool) -> Self {
        Self {
            id: RecordId::new(),
            name: name.into(),
            is_dev,
            include_in_ci,
        }
    }

    /// Whether CI builds for `target` publish into this epoch.
    pub fn matches_build_target(&self, target: BuildTarget) -> bool {
        self.include_in_ci && self.is_dev == (target == BuildTarget::Dev)
    }
}

/// A target distribution with its member packages and epochs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistroRecord {
    pub id: RecordId,
    pub name: String,
    pub package_ids: BTreeSet<RecordId>,
    pub epoch_ids: BTreeSet<RecordId>,
}

impl DistroRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: RecordId::new(),
            name: name.into(),
            package_ids: BTreeSet::new(),
            epoch_ids: BTreeSet::new(),
        }
    }

    pub fn with_package(mut self, package: &PackageRecord) -> Self {
        self.package_ids.insert(package.id);
        self
    }

    pub fn in_epoch(mut self, epoch: &EpochRecord) -> Self {
        self.epoch_ids.insert(epoch.id);
        self
    }
}

/// Uniqueness key of a package build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageBuildKey {
    pub package_id: RecordId,
    pub epoch_id: RecordId,
    pub run_id: String,
    pub version: String,
    pub build_target: BuildTarget,
}

/// One CI build of a package.
///
/// The architecture flags only ever go from `false` to `true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageBuildRecord {
    pub id: RecordId,
    pub package_id: RecordId,
    pub epoch_id: RecordId,
    pub run_id: String,
    pub version: String,
    pub build_target: BuildTarget,
    pub linux_64: bool,
    pub osx_64: bool,
    pub created_at: DateTime<Utc>,
}

impl PackageBuildRecord {
    pub fn from_key(key: PackageBuildKey) -> Self {
        Self {
            id: RecordId::new(),
            package_id: key.package_id,
            epoch_id: key.epoch_id,
            run_id: key.run_id,
            version: key.version,
            build_target: key.build_target,
            linux_64: false,
            osx_64: false,
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> PackageBuildKey {
        PackageBuildKey {
            package_id: self.package_id,
            epoch_id: self.epoch_id,
            run_id: self.run_id.clone(),
            version: self.version.clone(),
            build_target: self.build_target,
        }
    }
}

/// Lookup key of a distro build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DistroBuildKey {
    pub distro_id: RecordId,
    pub epoch_id: RecordId,
    pub version: String,
}

/// One promotion attempt of a distro within an epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistroBuildRecord {
    pub id: RecordId,
    pub distro_id: RecordId,
    /// Denormalised so artifact names can be validated without a lookup.
    pub distro_name: String,
    pub epoch_id: RecordId,
    pub version: String,
    pub staged_run_id: String,
    pub staged_linux_64: bool,
    pub staged_osx_64: bool,
    pub passed_run_id: String,
    pub passed_linux_64: bool,
    pub passed_osx_64: bool,
    /// Empty until the integration PR is opened.
    pub pr_url: String,
    pub package_build_ids: BTreeSet<RecordId>,
    pub created_at: DateTime<Utc>,
}

impl DistroBuildRecord {
    pub fn new(distro: &DistroRecord, epoch_id: RecordId, version: impl Into<String>) -> Self {
        Self {
            id: RecordId::new(),
            distro_id: distro.id,
            distro_name: distro.name.clone(),
            epoch_id,
            version: version.into(),
            staged_run_id: String::new(),
            staged_linux_64: false,
            staged_osx_64: false,
            passed_run_id: String::new(),
            passed_linux_64: false,
            passed_osx_64: false,
            pr_url: String::new(),
            package_build_ids: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> DistroBuildKey {
        DistroBuildKey {
            distro_id: self.distro_id,
            epoch_id: self.epoch_id,
            version: self.version.clone(),
        }
    }

    /// Link the package builds this promotion subsumes.
    pub fn attach_package_builds(&mut self, ids: impl IntoIterator<Item = RecordId>) {
        self.package_build_ids.extend(ids);
    }
}

/// The slice of a package build the integration resolver needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageBuildSummary {
    pub id: RecordId,
    pub package_name: String,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_target_parse_defaults_to_dev() {
        assert_eq!("".parse::<BuildTarget>().unwrap(), BuildTarget::Dev);
        assert_eq!("Release".parse::<BuildTarget>().unwrap(), BuildTarget::Release);
        assert!("nightly".parse::<BuildTarget>().is_err());
    }

    #[test]
    fn test_epoch_matches_build_target() {
        let dev = EpochRecord::new("2024.10", true, true);
        let release = EpochRecord::new("2024.5", false, true);
        let hidden = EpochRecord::new("2023.9", true, false);

        assert!(dev.matches_build_target(BuildTarget::Dev));
        assert!(!dev.matches_build_target(BuildTarget::Release));
        assert!(release.matches_build_target(BuildTarget::Release));
        assert!(!hidden.matches_build_target(BuildTarget::Dev));
    }

    #[test]
    fn test_record_id_round_trips_through_string() {
        let id = RecordId::new();
        let parsed: RecordId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_new_package_build_has_no_architectures() {
        let record = PackageBuildRecord::from_key(PackageBuildKey {
            package_id: RecordId::new(),
            epoch_id: RecordId::new(),
            run_id: "42".to_string(),
            version: "2024.10.0.dev0".to_string(),
            build_target: BuildTarget::Dev,
        });
        assert!(!record.linux_64);
        assert!(!record.osx_64);
    }
}
