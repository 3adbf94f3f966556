//! Integration repository recipes
//!
//! Two documents are maintained per epoch and gate:
//! - `conda_build_config.yaml`: package (snake_case) → one-element version list
//! - `<distro>/data.yaml`: metapackage recipe whose `run` list names packages
//!
//! Every read-modify-write runs under the recipe advisory lock. Content is
//! read from the main branch and committed to the target branch with the sha
//! that was read, so a concurrent commit makes ours fail instead of merging.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use library_core::{is_older, is_release, IntegrationRepo, PackageVersions, Settings};
use library_state::{with_advisory_lock, AdvisoryLock, Gate, LockKey};
use serde_yaml::Value;
use tracing::{debug, info};

use crate::client::{FileCommit, GitHubApi, NewPullRequest};
use crate::error::{GitHubError, Result};

pub const BUILD_CONFIG_FILE: &str = "conda_build_config.yaml";
pub const METAPACKAGE_FILE: &str = "data.yaml";

type Document = BTreeMap<String, Value>;

/// `<epoch>/<gate>[/<distro>]/<file>`
pub fn recipe_path(epoch: &str, gate: Gate, distro: Option<&str>, file: &str) -> String {
    match distro {
        Some(distro) => format!("{epoch}/{gate}/{distro}/{file}"),
        None => format!("{epoch}/{gate}/{file}"),
    }
}

/// Build configuration keys use underscores.
pub fn config_key(package: &str) -> String {
    package.replace('-', "_")
}

/// Markdown body for a sweep PR: chosen versions per distro, pre-releases flagged.
pub fn integration_pr_body(package_versions: &PackageVersions) -> Result<String> {
    let mut body = String::new();
    for (distro, versions) in package_versions {
        body.push_str(&format!("## {distro}\n\n"));
        for (package, version) in versions {
            let flag = if is_release(version)? { "" } else { " (pre-release)" };
            body.push_str(&format!("- {package} =={version}{flag}\n"));
        }
        body.push('\n');
    }
    Ok(body)
}

fn malformed(path: &str, reason: impl Into<String>) -> GitHubError {
    GitHubError::MalformedRecipe {
        path: path.to_string(),
        reason: reason.into(),
    }
}

/// The single recorded version of one build configuration entry.
fn recorded_version(path: &str, key: &str, value: &Value) -> Result<String> {
    let versions = value
        .as_sequence()
        .ok_or_else(|| malformed(path, format!("{key} is not a list")))?;
    match versions.as_slice() {
        [Value::String(s)] => Ok(s.clone()),
        [Value::Number(n)] => Ok(n.to_string()),
        [_] => Err(malformed(path, format!("{key} version is not a scalar"))),
        other => Err(malformed(
            path,
            format!("incorrect number of versions for {key}: {}", other.len()),
        )),
    }
}

fn check_update(branch: &str, epoch: &str, gate: Gate) -> Result<()> {
    if branch.is_empty() {
        return Err(GitHubError::Missing("branch"));
    }
    if epoch.is_empty() {
        return Err(GitHubError::Missing("epoch name"));
    }
    if !matches!(gate, Gate::Tested | Gate::Staged) {
        return Err(GitHubError::InvalidGate(gate.to_string()));
    }
    Ok(())
}

/// Recipe reads and writes against the integration repository.
#[derive(Clone)]
pub struct RecipeRepo {
    api: Arc<dyn GitHubApi>,
    lock: Arc<dyn AdvisoryLock>,
    lock_key: LockKey,
    repo: IntegrationRepo,
}

impl RecipeRepo {
    pub fn new(api: Arc<dyn GitHubApi>, lock: Arc<dyn AdvisoryLock>, settings: &Settings) -> Self {
        Self {
            api,
            lock,
            lock_key: settings.recipe_lock,
            repo: settings.integration_repo.clone(),
        }
    }

    /// Record new versions in one build configuration file.
    ///
    /// `distro` is `None` for the epoch-wide file package builds update.
    pub async fn update_build_config(
        &self,
        branch: &str,
        epoch: &str,
        gate: Gate,
        distro: Option<&str>,
        versions: &BTreeMap<String, String>,
    ) -> Result<()> {
        check_update(branch, epoch, gate)?;
        if versions.is_empty() {
            return Err(GitHubError::Missing("package versions"));
        }

        with_advisory_lock(&self.lock, self.lock_key, move || async move {
            self.merge_build_config(branch, epoch, gate, distro, versions)
                .await
        })
        .await
    }

    /// Update every distro's build configuration and metapackage recipe.
    pub async fn update_integration(
        &self,
        branch: &str,
        epoch: &str,
        gate: Gate,
        package_versions: &PackageVersions,
    ) -> Result<()> {
        check_update(branch, epoch, gate)?;
        if package_versions.is_empty() {
            return Err(GitHubError::Missing("package versions"));
        }
        if package_versions.keys().any(String::is_empty) {
            return Err(GitHubError::Missing("distro name"));
        }

        with_advisory_lock(&self.lock, self.lock_key, move || async move {
            for (distro, versions) in package_versions {
                self.merge_build_config(branch, epoch, gate, Some(distro), versions)
                    .await?;
            }
            for (distro, versions) in package_versions {
                self.merge_metapackage(branch, epoch, gate, distro, versions.keys())
                    .await?;
            }
            Ok(())
        })
        .await
    }

    /// Create `branch` from the tip of the main branch if it does not exist.
    pub async fn ensure_branch(&self, branch: &str) -> Result<()> {
        let slug = self.repo.slug();
        if self.api.branch_exists(&slug, branch).await? {
            return Ok(());
        }
        let sha = self.api.get_ref(&slug, &self.repo.main_branch).await?;
        self.api.create_ref(&slug, branch, &sha).await?;
        info!(branch, base = %self.repo.main_branch, "created integration branch");
        Ok(())
    }

    /// Open a PR from `branch` into the main branch, returning its url.
    pub async fn open_pr(&self, branch: &str, title: &str, body: &str) -> Result<String> {
        let url = self
            .api
            .create_pr(
                &self.repo.slug(),
                &NewPullRequest {
                    title: title.to_string(),
                    head: branch.to_string(),
                    base: self.repo.main_branch.clone(),
                    body: body.to_string(),
                },
            )
            .await?;
        info!(branch, pr_url = %url, "opened integration pr");
        Ok(url)
    }

    /// Merge PR `number` unless it already is.
    pub async fn merge_pr(&self, number: u64) -> Result<()> {
        let slug = self.repo.slug();
        if self.api.is_merged(&slug, number).await? {
            info!(pr = number, "integration pr already merged");
            return Ok(());
        }
        let result = self
            .api
            .merge_pr(&slug, number, &format!("merging pr {number}"))
            .await?;
        if !result.merged {
            return Err(GitHubError::MergeFailed {
                number,
                message: result.message,
            });
        }
        info!(pr = number, "merged integration pr");
        Ok(())
    }

    async fn read_yaml(&self, path: &str) -> Result<(Document, Option<String>)> {
        let file = self
            .api
            .get_content(&self.repo.slug(), path, &self.repo.main_branch)
            .await?;
        let Some(file) = file else {
            debug!(path, "recipe missing, starting empty");
            return Ok((Document::new(), None));
        };
        if file.content.iter().all(u8::is_ascii_whitespace) {
            return Ok((Document::new(), Some(file.sha)));
        }
        let doc: Option<Document> = serde_yaml::from_slice(&file.content)?;
        Ok((doc.unwrap_or_default(), Some(file.sha)))
    }

    async fn write_yaml(
        &self,
        branch: &str,
        path: String,
        doc: &Document,
        sha: Option<String>,
        message: String,
    ) -> Result<()> {
        let content = serde_yaml::to_string(doc)?.into_bytes();
        self.ensure_branch(branch).await?;
        self.api
            .put_file(
                &self.repo.slug(),
                &FileCommit {
                    path,
                    message,
                    content,
                    sha,
                    branch: branch.to_string(),
                },
            )
            .await
    }

    async fn merge_build_config(
        &self,
        branch: &str,
        epoch: &str,
        gate: Gate,
        distro: Option<&str>,
        versions: &BTreeMap<String, String>,
    ) -> Result<()> {
        let path = recipe_path(epoch, gate, distro, BUILD_CONFIG_FILE);
        let (mut doc, sha) = self.read_yaml(&path).await?;
        let mut message = format!("updating {path}\n\n");
        let mut changed = 0usize;

        for (package, version) in versions {
            let key = config_key(package);
            if let Some(existing) = doc.get(&key) {
                let recorded = recorded_version(&path, &key, existing)?;
                if is_older(version, &recorded)? {
                    return Err(GitHubError::VersionConflict {
                        package: key,
                        recorded,
                        requested: version.clone(),
                    });
                }
                if !is_older(&recorded, version)? {
                    debug!(path = %path, package = %key, version = %recorded, "version already recorded");
                    continue;
                }
            }
            doc.insert(key.clone(), Value::Sequence(vec![Value::String(version.clone())]));
            message.push_str(&format!("- {key} =={version}\n"));
            changed += 1;
        }
        if changed == 0 {
            return Ok(());
        }

        self.write_yaml(branch, path.clone(), &doc, sha, message).await?;
        info!(path = %path, branch, entries = changed, "build configuration updated");
        Ok(())
    }

    async fn merge_metapackage<'a>(
        &self,
        branch: &str,
        epoch: &str,
        gate: Gate,
        distro: &str,
        packages: impl Iterator<Item = &'a String>,
    ) -> Result<()> {
        let path = recipe_path(epoch, gate, Some(distro), METAPACKAGE_FILE);
        let (mut doc, sha) = self.read_yaml(&path).await?;

        let mut run = match doc.get("run") {
            None | Some(Value::Null) => BTreeSet::new(),
            Some(Value::Sequence(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| malformed(&path, "run entries must be strings"))
                })
                .collect::<Result<BTreeSet<_>>>()?,
            Some(_) => return Err(malformed(&path, "run is not a list")),
        };

        let mut message = format!("updating {path}\n\n");
        let mut added = 0usize;
        for package in packages {
            if run.insert(package.clone()) {
                message.push_str(&format!("- {package}\n"));
                added += 1;
            }
        }
        if added == 0 && sha.is_some() {
            debug!(path = %path, "metapackage already lists every package");
            return Ok(());
        }

        doc.insert(
            "run".to_string(),
            Value::Sequence(run.into_iter().map(Value::String).collect()),
        );
        self.write_yaml(branch, path.clone(), &doc, sha, message).await?;
        info!(path = %path, branch, added, "metapackage recipe updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recipe_paths() {
        assert_eq!(
            recipe_path("2024.10", Gate::Tested, None, BUILD_CONFIG_FILE),
            "2024.10/tested/conda_build_config.yaml"
        );
        assert_eq!(
            recipe_path("2024.10", Gate::Staged, Some("core"), METAPACKAGE_FILE),
            "2024.10/staged/core/data.yaml"
        );
    }

    #[test]
    fn test_config_key_is_snake_case() {
        assert_eq!(config_key("q2-feature-table"), "q2_feature_table");
    }

    #[test]
    fn test_recorded_version_shapes() {
        let one: Value = serde_yaml::from_str("['2024.10.0']").unwrap();
        assert_eq!(recorded_version("p", "k", &one).unwrap(), "2024.10.0");

        let numeric: Value = serde_yaml::from_str("[1.2]").unwrap();
        assert_eq!(recorded_version("p", "k", &numeric).unwrap(), "1.2");

        let two: Value = serde_yaml::from_str("['1.0', '1.1']").unwrap();
        assert!(matches!(
            recorded_version("p", "k", &two),
            Err(GitHubError::MalformedRecipe { .. })
        ));
    }

    #[test]
    fn test_pr_body_flags_prereleases() {
        let versions = PackageVersions::from([(
            "core".to_string(),
            BTreeMap::from([
                ("q2-types".to_string(), "2024.10.0".to_string()),
                ("q2-cutadapt".to_string(), "2024.10.0.dev3".to_string()),
            ]),
        )]);
        let body = integration_pr_body(&versions).unwrap();
        assert!(body.contains("## core"));
        assert!(body.contains("- q2-types ==2024.10.0\n"));
        assert!(body.contains("- q2-cutadapt ==2024.10.0.dev3 (pre-release)\n"));
    }

    #[test]
    fn test_only_tested_and_staged_accept_updates() {
        assert!(check_update("main", "2024.10", Gate::Tested).is_ok());
        assert!(check_update("main", "2024.10", Gate::Staged).is_ok());
        assert!(matches!(
            check_update("main", "2024.10", Gate::Passed),
            Err(GitHubError::InvalidGate(_))
        ));
        assert!(matches!(
            check_update("", "2024.10", Gate::Tested),
            Err(GitHubError::Missing("branch"))
        ));
    }
}
