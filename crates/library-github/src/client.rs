//! GitHub REST client
//!
//! [`GitHubApi`] is the seam the rest of the pipeline talks to; [`RestGitHub`]
//! implements it over `reqwest`. Every method takes the `owner/repo` it acts
//! on so one client serves both package CI projects and the integration repo.

use std::path::Path;

use async_trait::async_trait;
use base64::Engine as _;
use futures::StreamExt;
use library_core::Settings;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{GitHubError, Result};

/// One entry of a workflow run's artifact listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub id: u64,
    pub name: String,
    pub size_in_bytes: u64,
    pub archive_download_url: String,
}

/// Decoded file content plus the blob sha needed to update it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub content: Vec<u8>,
    pub sha: String,
}

/// A create-or-update of one file on one branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCommit {
    pub path: String,
    pub message: String,
    pub content: Vec<u8>,
    /// Sha of the blob being replaced; `None` creates the file.
    pub sha: Option<String>,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPullRequest {
    pub title: String,
    pub head: String,
    pub base: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MergeResult {
    pub merged: bool,
    #[serde(default)]
    pub message: String,
}

/// The subset of the GitHub API the pipeline uses.
#[async_trait]
pub trait GitHubApi: Send + Sync {
    /// Artifacts published by a workflow run.
    async fn list_artifacts(&self, repository: &str, run_id: &str) -> Result<Vec<ArtifactRecord>>;

    /// Stream `url` into `dest`, which must not exist. Returns bytes written.
    async fn download(&self, url: &str, dest: &Path) -> Result<u64>;

    /// File content at `git_ref`, `None` when the file does not exist.
    async fn get_content(
        &self,
        repository: &str,
        path: &str,
        git_ref: &str,
    ) -> Result<Option<FileContent>>;

    async fn branch_exists(&self, repository: &str, branch: &str) -> Result<bool>;

    /// Commit sha at the tip of `branch`.
    async fn get_ref(&self, repository: &str, branch: &str) -> Result<String>;

    async fn create_ref(&self, repository: &str, branch: &str, sha: &str) -> Result<()>;

    /// Create or update a file; a stale `sha` is rejected by GitHub.
    async fn put_file(&self, repository: &str, commit: &FileCommit) -> Result<()>;

    /// Open a pull request, returning its html url.
    async fn create_pr(&self, repository: &str, pr: &NewPullRequest) -> Result<String>;

    async fn is_merged(&self, repository: &str, number: u64) -> Result<bool>;

    async fn merge_pr(&self, repository: &str, number: u64, title: &str) -> Result<MergeResult>;
}

/// Map non-success statuses onto [`GitHubError`].
async fn check_response(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        return Err(GitHubError::NotFound(resp.url().path().to_string()));
    }
    if !status.is_success() {
        return Err(GitHubError::Api {
            status: status.as_u16(),
            message: resp.text().await.unwrap_or_default(),
        });
    }
    Ok(resp)
}

/// Treat a 404 as absence.
fn found<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(GitHubError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// `reqwest`-backed [`GitHubApi`].
#[derive(Debug, Clone)]
pub struct RestGitHub {
    http: reqwest::Client,
    api_url: String,
    token: String,
}

impl RestGitHub {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("library-pipeline/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(&settings.github_api_url, &settings.github_token)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    fn repo_url(&self, repository: &str, rest: &str) -> String {
        format!("{}/repos/{}/{}", self.api_url, repository, rest)
    }

    async fn send_json<T: serde::de::DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let resp = check_response(builder.send().await?).await?;
        Ok(resp.json::<T>().await?)
    }
}

#[derive(Deserialize)]
struct ArtifactList {
    artifacts: Vec<ArtifactRecord>,
}

#[derive(Deserialize)]
struct ContentPayload {
    content: String,
    sha: String,
}

#[derive(Deserialize)]
struct RefObject {
    sha: String,
}

#[derive(Deserialize)]
struct RefPayload {
    object: RefObject,
}

#[derive(Deserialize)]
struct PullPayload {
    html_url: String,
}

#[async_trait]
impl GitHubApi for RestGitHub {
    async fn list_artifacts(&self, repository: &str, run_id: &str) -> Result<Vec<ArtifactRecord>> {
        let url = self.repo_url(repository, &format!("actions/runs/{run_id}/artifacts"));
        let list: ArtifactList = self.send_json(self.request(Method::GET, &url)).await?;
        debug!(repository, run_id, count = list.artifacts.len(), "listed run artifacts");
        Ok(list.artifacts)
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let resp = check_response(self.request(Method::GET, url).send().await?).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dest)
            .await?;

        let mut written = 0u64;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    async fn get_content(
        &self,
        repository: &str,
        path: &str,
        git_ref: &str,
    ) -> Result<Option<FileContent>> {
        let url = self.repo_url(repository, &format!("contents/{path}"));
        let payload: Option<ContentPayload> = found(
            self.send_json(self.request(Method::GET, &url).query(&[("ref", git_ref)]))
                .await,
        )?;
        let Some(payload) = payload else {
            return Ok(None);
        };

        // GitHub wraps the base64 body at 60 columns.
        let packed: String = payload.content.split_whitespace().collect();
        let content = base64::engine::general_purpose::STANDARD
            .decode(packed)
            .map_err(|e| GitHubError::Decode(format!("{path}: {e}")))?;
        Ok(Some(FileContent {
            content,
            sha: payload.sha,
        }))
    }

    async fn branch_exists(&self, repository: &str, branch: &str) -> Result<bool> {
        let url = self.repo_url(repository, &format!("branches/{branch}"));
        let resp = found(check_response(self.request(Method::GET, &url).send().await?).await)?;
        Ok(resp.is_some())
    }

    async fn get_ref(&self, repository: &str, branch: &str) -> Result<String> {
        let url = self.repo_url(repository, &format!("git/ref/heads/{branch}"));
        let payload: RefPayload = self.send_json(self.request(Method::GET, &url)).await?;
        Ok(payload.object.sha)
    }

    async fn create_ref(&self, repository: &str, branch: &str, sha: &str) -> Result<()> {
        let url = self.repo_url(repository, "git/refs");
        let body = json!({ "ref": format!("refs/heads/{branch}"), "sha": sha });
        check_response(self.request(Method::POST, &url).json(&body).send().await?).await?;
        Ok(())
    }

    async fn put_file(&self, repository: &str, commit: &FileCommit) -> Result<()> {
        let url = self.repo_url(repository, &format!("contents/{}", commit.path));
        let mut body = json!({
            "message": commit.message,
            "content": base64::engine::general_purpose::STANDARD.encode(&commit.content),
            "branch": commit.branch,
        });
        if let Some(sha) = &commit.sha {
            body["sha"] = json!(sha);
        }
        check_response(self.request(Method::PUT, &url).json(&body).send().await?).await?;
        Ok(())
    }

    async fn create_pr(&self, repository: &str, pr: &NewPullRequest) -> Result<String> {
        let url = self.repo_url(repository, "pulls");
        let body = json!({
            "title": pr.title,
            "head": pr.head,
            "base": pr.base,
            "body": pr.body,
            "maintainer_can_modify": true,
            "draft": false,
        });
        let payload: PullPayload = self.send_json(self.request(Method::POST, &url).json(&body)).await?;
        Ok(payload.html_url)
    }

    async fn is_merged(&self, repository: &str, number: u64) -> Result<bool> {
        // 204 when merged, 404 when not.
        let url = self.repo_url(repository, &format!("pulls/{number}/merge"));
        let resp = found(check_response(self.request(Method::GET, &url).send().await?).await)?;
        Ok(resp.is_some())
    }

    async fn merge_pr(&self, repository: &str, number: u64, title: &str) -> Result<MergeResult> {
        let url = self.repo_url(repository, &format!("pulls/{number}/merge"));
        let body = json!({ "commit_title": title, "merge_method": "merge" });
        self.send_json(self.request(Method::PUT, &url).json(&body)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_url_trims_trailing_slash() {
        let client = RestGitHub::new("https://ghe.example.com/api/v3/", "t").unwrap();
        assert_eq!(
            client.repo_url("qiime2/q2-types", "actions/runs/7/artifacts"),
            "https://ghe.example.com/api/v3/repos/qiime2/q2-types/actions/runs/7/artifacts"
        );
    }

    #[test]
    fn test_found_maps_not_found_to_none() {
        let missing: Result<u8> = Err(GitHubError::NotFound("/x".to_string()));
        assert_eq!(found(missing).unwrap(), None);
        assert_eq!(found(Ok(3u8)).unwrap(), Some(3));
        let other: Result<u8> = Err(GitHubError::LockNotReady);
        assert!(found(other).is_err());
    }

    #[test]
    fn test_artifact_listing_deserializes() {
        let list: ArtifactList = serde_json::from_value(json!({
            "total_count": 1,
            "artifacts": [{
                "id": 11,
                "name": "linux-64",
                "size_in_bytes": 2048,
                "archive_download_url": "https://api.github.com/repos/o/r/actions/artifacts/11/zip",
                "expired": false
            }]
        }))
        .unwrap();
        assert_eq!(list.artifacts[0].name, "linux-64");
        assert_eq!(list.artifacts[0].size_in_bytes, 2048);
    }
}
