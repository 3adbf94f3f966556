//! In-memory GitHub fake (testing only)
//!
//! `MemoryGitHub` models one integration repository (branches, files with
//! content shas, pull requests) plus run artifacts, and counts every call so
//! tests can assert that nothing touched git.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::client::{ArtifactRecord, FileCommit, FileContent, GitHubApi, MergeResult, NewPullRequest};
use crate::error::{GitHubError, Result};

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn content_sha(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

#[derive(Debug, Default)]
struct Repo {
    artifacts: HashMap<(String, String), Vec<ArtifactRecord>>,
    downloads: HashMap<String, Vec<u8>>,
    /// branch → path → (content, sha)
    files: BTreeMap<String, BTreeMap<String, (Vec<u8>, String)>>,
    commits: Vec<FileCommit>,
    pulls: Vec<NewPullRequest>,
    merged: BTreeSet<u64>,
    refuse_merges: bool,
    calls: BTreeMap<&'static str, usize>,
}

impl Repo {
    fn record(&mut self, call: &'static str) {
        *self.calls.entry(call).or_default() += 1;
    }
}

/// In-memory [`GitHubApi`].
#[derive(Debug)]
pub struct MemoryGitHub {
    repo: Mutex<Repo>,
}

impl Default for MemoryGitHub {
    fn default() -> Self {
        let mut repo = Repo::default();
        repo.files.insert("main".to_string(), BTreeMap::new());
        Self {
            repo: Mutex::new(repo),
        }
    }
}

impl MemoryGitHub {
    /// A repository with an empty `main` branch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a downloadable artifact for a run.
    pub fn publish_artifact(&self, repository: &str, run_id: &str, name: &str, archive: Vec<u8>) {
        let url = format!("memory://{repository}/{run_id}/{name}");
        let record = ArtifactRecord {
            id: 0,
            name: name.to_string(),
            size_in_bytes: archive.len() as u64,
            archive_download_url: url.clone(),
        };
        let mut repo = guard(&self.repo);
        repo.downloads.insert(url, archive);
        repo.artifacts
            .entry((repository.to_string(), run_id.to_string()))
            .or_default()
            .push(record);
    }

    /// List an artifact whose download fails.
    pub fn list_only_artifact(&self, repository: &str, run_id: &str, record: ArtifactRecord) {
        guard(&self.repo)
            .artifacts
            .entry((repository.to_string(), run_id.to_string()))
            .or_default()
            .push(record);
    }

    /// Put a file on `branch` without recording a commit.
    pub fn seed_file(&self, branch: &str, path: &str, content: &str) {
        let bytes = content.as_bytes().to_vec();
        let sha = content_sha(&bytes);
        guard(&self.repo)
            .files
            .entry(branch.to_string())
            .or_default()
            .insert(path.to_string(), (bytes, sha));
    }

    /// Current content of `path` on `branch`.
    pub fn file(&self, branch: &str, path: &str) -> Option<String> {
        guard(&self.repo)
            .files
            .get(branch)
            .and_then(|files| files.get(path))
            .map(|(content, _)| String::from_utf8_lossy(content).into_owned())
    }

    pub fn has_branch(&self, branch: &str) -> bool {
        guard(&self.repo).files.contains_key(branch)
    }

    pub fn commits(&self) -> Vec<FileCommit> {
        guard(&self.repo).commits.clone()
    }

    pub fn pull_requests(&self) -> Vec<NewPullRequest> {
        guard(&self.repo).pulls.clone()
    }

    pub fn mark_merged(&self, number: u64) {
        guard(&self.repo).merged.insert(number);
    }

    pub fn is_pr_merged(&self, number: u64) -> bool {
        guard(&self.repo).merged.contains(&number)
    }

    /// Make every merge report `merged: false`.
    pub fn refuse_merges(&self) {
        guard(&self.repo).refuse_merges = true;
    }

    /// Calls made to one API method.
    pub fn calls(&self, method: &str) -> usize {
        guard(&self.repo).calls.get(method).copied().unwrap_or(0)
    }

    /// Calls made to any git (non-artifact) method.
    pub fn git_calls(&self) -> usize {
        guard(&self.repo)
            .calls
            .iter()
            .filter(|(name, _)| !matches!(**name, "list_artifacts" | "download"))
            .map(|(_, n)| n)
            .sum()
    }
}

#[async_trait]
impl GitHubApi for MemoryGitHub {
    async fn list_artifacts(&self, repository: &str, run_id: &str) -> Result<Vec<ArtifactRecord>> {
        let mut repo = guard(&self.repo);
        repo.record("list_artifacts");
        Ok(repo
            .artifacts
            .get(&(repository.to_string(), run_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let bytes = {
            let mut repo = guard(&self.repo);
            repo.record("download");
            repo.downloads
                .get(url)
                .cloned()
                .ok_or_else(|| GitHubError::NotFound(url.to_string()))?
        };
        if tokio::fs::try_exists(dest).await? {
            return Err(GitHubError::WouldOverwrite(dest.to_path_buf()));
        }
        tokio::fs::write(dest, &bytes).await?;
        Ok(bytes.len() as u64)
    }

    async fn get_content(
        &self,
        _repository: &str,
        path: &str,
        git_ref: &str,
    ) -> Result<Option<FileContent>> {
        let mut repo = guard(&self.repo);
        repo.record("get_content");
        Ok(repo
            .files
            .get(git_ref)
            .and_then(|files| files.get(path))
            .map(|(content, sha)| FileContent {
                content: content.clone(),
                sha: sha.clone(),
            }))
    }

    async fn branch_exists(&self, _repository: &str, branch: &str) -> Result<bool> {
        let mut repo = guard(&self.repo);
        repo.record("branch_exists");
        Ok(repo.files.contains_key(branch))
    }

    async fn get_ref(&self, _repository: &str, branch: &str) -> Result<String> {
        let mut repo = guard(&self.repo);
        repo.record("get_ref");
        if repo.files.contains_key(branch) {
            Ok(content_sha(branch.as_bytes()))
        } else {
            Err(GitHubError::NotFound(format!("heads/{branch}")))
        }
    }

    async fn create_ref(&self, _repository: &str, branch: &str, sha: &str) -> Result<()> {
        let mut repo = guard(&self.repo);
        repo.record("create_ref");
        if repo.files.contains_key(branch) {
            return Err(GitHubError::Api {
                status: 422,
                message: "Reference already exists".to_string(),
            });
        }
        let base = repo
            .files
            .iter()
            .find(|(name, _)| content_sha(name.as_bytes()) == sha)
            .map(|(_, files)| files.clone())
            .ok_or_else(|| GitHubError::NotFound(sha.to_string()))?;
        repo.files.insert(branch.to_string(), base);
        Ok(())
    }

    async fn put_file(&self, _repository: &str, commit: &FileCommit) -> Result<()> {
        let mut repo = guard(&self.repo);
        repo.record("put_file");
        let Some(files) = repo.files.get_mut(&commit.branch) else {
            return Err(GitHubError::NotFound(format!("heads/{}", commit.branch)));
        };
        let current = files.get(&commit.path).map(|(_, sha)| sha.clone());
        if current != commit.sha {
            return Err(GitHubError::Api {
                status: 409,
                message: format!("{} does not match {:?}", commit.path, commit.sha),
            });
        }
        let sha = content_sha(&commit.content);
        files.insert(commit.path.clone(), (commit.content.clone(), sha));
        repo.commits.push(commit.clone());
        Ok(())
    }

    async fn create_pr(&self, repository: &str, pr: &NewPullRequest) -> Result<String> {
        let mut repo = guard(&self.repo);
        repo.record("create_pr");
        repo.pulls.push(pr.clone());
        Ok(format!("https://github.com/{repository}/pull/{}", repo.pulls.len()))
    }

    async fn is_merged(&self, _repository: &str, number: u64) -> Result<bool> {
        let mut repo = guard(&self.repo);
        repo.record("is_merged");
        Ok(repo.merged.contains(&number))
    }

    async fn merge_pr(&self, _repository: &str, number: u64, title: &str) -> Result<MergeResult> {
        let mut repo = guard(&self.repo);
        repo.record("merge_pr");
        if repo.refuse_merges {
            return Ok(MergeResult {
                merged: false,
                message: format!("{title}: pull request is not mergeable"),
            });
        }
        repo.merged.insert(number);
        Ok(MergeResult {
            merged: true,
            message: "Pull Request successfully merged".to_string(),
        })
    }
}
