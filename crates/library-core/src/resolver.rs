//! Integration resolver: picks the newest ready build of each package per distro.

use std::collections::{BTreeMap, BTreeSet};

use library_state::{PackageBuildSummary, RecordId};
use serde::{Deserialize, Serialize};

use crate::error::VersionError;
use crate::version::{is_older, is_release};

/// distro name → package name → version
pub type PackageVersions = BTreeMap<String, BTreeMap<String, String>>;

/// Outcome of resolving one epoch's candidates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationPlan {
    pub package_versions: PackageVersions,
    /// Builds that established or replaced a chosen version.
    pub package_build_ids: BTreeSet<RecordId>,
}

impl IntegrationPlan {
    pub fn is_empty(&self) -> bool {
        self.package_versions.is_empty()
    }

    /// Only the final-release versions, dropping distros left empty.
    pub fn release_versions(&self) -> Result<PackageVersions, VersionError> {
        let mut filtered = PackageVersions::new();
        for (distro, versions) in &self.package_versions {
            for (package, version) in versions {
                if is_release(version)? {
                    filtered
                        .entry(distro.clone())
                        .or_default()
                        .insert(package.clone(), version.clone());
                }
            }
        }
        Ok(filtered)
    }
}

/// Resolve per-distro candidates into one version per package.
///
/// Within a distro a candidate replaces the current pick only when its
/// version is strictly newer. Equal versions keep the first-seen build and
/// do not contribute their id. Never touches persisted state.
pub fn resolve(
    candidates: &BTreeMap<String, Vec<PackageBuildSummary>>,
) -> Result<IntegrationPlan, VersionError> {
    let mut plan = IntegrationPlan::default();

    for (distro, records) in candidates {
        let chosen = plan.package_versions.entry(distro.clone()).or_default();
        for record in records {
            let replace = match chosen.get(&record.package_name) {
                Some(current) => is_older(current, &record.version)?,
                None => true,
            };
            if replace {
                chosen.insert(record.package_name.clone(), record.version.clone());
                plan.package_build_ids.insert(record.id);
            }
        }
    }

    plan.package_versions.retain(|_, versions| !versions.is_empty());
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(name: &str, version: &str) -> PackageBuildSummary {
        PackageBuildSummary {
            id: RecordId::new(),
            package_name: name.to_string(),
            version: version.to_string(),
        }
    }

    #[test]
    fn test_newest_wins_and_equal_versions_do_not_overwrite() {
        let a10 = summary("pkgA", "1.0");
        let a12 = summary("pkgA", "1.2");
        let a12_again = summary("pkgA", "1.2");
        let candidates = BTreeMap::from([(
            "core".to_string(),
            vec![a10.clone(), a12.clone(), a12_again.clone()],
        )]);

        let plan = resolve(&candidates).unwrap();

        assert_eq!(plan.package_versions["core"]["pkgA"], "1.2");
        assert_eq!(plan.package_build_ids.len(), 2);
        assert!(plan.package_build_ids.contains(&a10.id));
        assert!(plan.package_build_ids.contains(&a12.id));
        assert!(!plan.package_build_ids.contains(&a12_again.id));
    }

    #[test]
    fn test_older_candidate_after_newer_is_ignored() {
        let newer = summary("pkgA", "2.0");
        let older = summary("pkgA", "1.5");
        let candidates = BTreeMap::from([("core".to_string(), vec![newer.clone(), older])]);

        let plan = resolve(&candidates).unwrap();
        assert_eq!(plan.package_versions["core"]["pkgA"], "2.0");
        assert_eq!(plan.package_build_ids, BTreeSet::from([newer.id]));
    }

    #[test]
    fn test_distros_resolve_independently() {
        let candidates = BTreeMap::from([
            ("core".to_string(), vec![summary("pkgA", "1.0")]),
            (
                "amplicon".to_string(),
                vec![summary("pkgA", "1.1"), summary("pkgB", "0.3")],
            ),
            ("empty".to_string(), vec![]),
        ]);

        let plan = resolve(&candidates).unwrap();
        assert_eq!(plan.package_versions["core"]["pkgA"], "1.0");
        assert_eq!(plan.package_versions["amplicon"]["pkgA"], "1.1");
        assert_eq!(plan.package_versions["amplicon"].len(), 2);
        assert!(!plan.package_versions.contains_key("empty"));
        assert_eq!(plan.package_build_ids.len(), 3);
    }

    #[test]
    fn test_no_candidates_is_empty_plan() {
        let plan = resolve(&BTreeMap::new()).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_release_versions_drop_prereleases() {
        let candidates = BTreeMap::from([
            (
                "core".to_string(),
                vec![summary("pkgA", "2024.10.0"), summary("pkgB", "2024.10.0.dev1")],
            ),
            ("amplicon".to_string(), vec![summary("pkgC", "1.0rc1")]),
        ]);

        let releases = resolve(&candidates).unwrap().release_versions().unwrap();
        assert_eq!(releases.len(), 1);
        assert_eq!(releases["core"].len(), 1);
        assert_eq!(releases["core"]["pkgA"], "2024.10.0");
    }

    #[test]
    fn test_invalid_version_is_an_error() {
        let candidates = BTreeMap::from([(
            "core".to_string(),
            vec![summary("pkgA", "1.0"), summary("pkgA", "latest")],
        )]);
        assert!(resolve(&candidates).is_err());
    }
}
