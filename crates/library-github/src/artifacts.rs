//! CI artifact sync
//!
//! Fetches the single artifact a workflow run published under a given name,
//! unpacks it and copies the package files it contains into a channel.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::Glob;
use library_core::{BuildConfig, ChannelError};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::client::{ArtifactRecord, GitHubApi};
use crate::error::{GitHubError, Result};

/// What to fetch: one named artifact of one workflow run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRequest {
    pub github_token: String,
    /// `owner/repo`
    pub repository: String,
    pub run_id: String,
    pub artifact_name: String,
}

impl ArtifactRequest {
    pub fn from_config(config: &BuildConfig) -> Self {
        Self {
            github_token: config.github_token().to_string(),
            repository: config.repository(),
            run_id: config.run_id().to_string(),
            artifact_name: config.artifact_name().to_string(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.github_token.is_empty() {
            return Err(GitHubError::Missing("github token"));
        }
        if self.repository.is_empty() {
            return Err(GitHubError::Missing("github repository"));
        }
        match self.repository.split('/').collect::<Vec<_>>().as_slice() {
            [owner, repo] if !owner.is_empty() && !repo.is_empty() => {}
            _ => return Err(GitHubError::InvalidRepository(self.repository.clone())),
        }
        if self.run_id.is_empty() {
            return Err(GitHubError::Missing("github actions run id"));
        }
        if self.artifact_name.is_empty() {
            return Err(GitHubError::Missing("artifact name"));
        }
        Ok(())
    }
}

/// Downloads run artifacts and stages their packages into channels.
#[derive(Clone)]
pub struct ArtifactSync {
    api: Arc<dyn GitHubApi>,
    size_limit: u64,
}

impl ArtifactSync {
    pub fn new(api: Arc<dyn GitHubApi>, size_limit: u64) -> Self {
        Self { api, size_limit }
    }

    /// Pick the one record named like the request.
    ///
    /// Oversize matches and duplicates are configuration errors; no match at
    /// all means the run has not uploaded yet.
    pub fn select<'r>(
        &self,
        request: &ArtifactRequest,
        records: &'r [ArtifactRecord],
    ) -> Result<&'r ArtifactRecord> {
        let mut matches = Vec::new();
        for record in records.iter().filter(|r| r.name == request.artifact_name) {
            if record.size_in_bytes > self.size_limit {
                return Err(GitHubError::ArtifactTooLarge {
                    artifact: record.name.clone(),
                    size: record.size_in_bytes,
                    limit: self.size_limit,
                });
            }
            matches.push(record);
        }

        match matches.as_slice() {
            [one] => Ok(*one),
            [] => Err(GitHubError::ArtifactNotReady {
                artifact: request.artifact_name.clone(),
                found: 0,
            }),
            many => Err(GitHubError::AmbiguousArtifact {
                artifact: request.artifact_name.clone(),
                found: many.len(),
            }),
        }
    }

    /// Download the requested artifact archive into `scratch`.
    pub async fn fetch(&self, request: &ArtifactRequest, scratch: &Path) -> Result<PathBuf> {
        request.validate()?;

        let records = self
            .api
            .list_artifacts(&request.repository, &request.run_id)
            .await?;
        let record = self.select(request, &records)?;

        let dest = scratch.join(&record.name);
        if tokio::fs::try_exists(&dest).await? {
            return Err(GitHubError::WouldOverwrite(dest));
        }

        let bytes = self
            .api
            .download(&record.archive_download_url, &dest)
            .await
            .map_err(|e| {
                if matches!(
                    e,
                    GitHubError::Http(_) | GitHubError::Api { .. } | GitHubError::NotFound(_)
                ) {
                    debug!(error = %e, "artifact download failed");
                    GitHubError::ArtifactNotReady {
                        artifact: request.artifact_name.clone(),
                        found: 1,
                    }
                } else {
                    e
                }
            })?;

        info!(
            repository = %request.repository,
            run_id = %request.run_id,
            artifact = %record.name,
            bytes,
            "artifact downloaded"
        );
        Ok(dest)
    }

    /// Fetch, unpack and copy every `*<package_name>*.tar.bz2` into `to_channel`.
    ///
    /// Returns channel-relative paths of the copied files.
    pub async fn sync(
        &self,
        request: &ArtifactRequest,
        package_name: &str,
        to_channel: &Path,
    ) -> Result<Vec<PathBuf>> {
        let scratch = tempfile::tempdir()?;
        let archive = self.fetch(request, scratch.path()).await?;

        library_core::channel::bootstrap(to_channel).await?;

        let package_name = package_name.to_string();
        let to_channel = to_channel.to_path_buf();
        let root = scratch.path().to_path_buf();
        let copied = tokio::task::spawn_blocking(move || -> Result<Vec<PathBuf>> {
            unzip(&archive)?;
            copy_packages(&root, &package_name, &to_channel)
        })
        .await
        .map_err(|e| GitHubError::Io(std::io::Error::other(e)))??;

        info!(files = copied.len(), "artifact packages copied");
        Ok(copied)
    }
}

/// Extract `archive` into a sibling `<name>_unzipped` directory.
pub fn unzip(archive: &Path) -> Result<PathBuf> {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dest = archive.with_file_name(format!("{name}_unzipped"));

    let mut zip = zip::ZipArchive::new(File::open(archive)?)?;
    zip.extract(&dest)?;
    Ok(dest)
}

/// Copy package files under `root` into `to_channel/<parent dir>/<file>`.
pub fn copy_packages(root: &Path, package_name: &str, to_channel: &Path) -> Result<Vec<PathBuf>> {
    let pattern = format!("**/*{package_name}*.tar.bz2");
    let matcher = Glob::new(&pattern)
        .map_err(|e| ChannelError::Pattern {
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?
        .compile_matcher();

    let mut copied = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if !matcher.is_match(relative) {
            continue;
        }
        let Some(subdir) = entry.path().parent().and_then(Path::file_name) else {
            continue;
        };

        let target = PathBuf::from(subdir).join(entry.file_name());
        std::fs::create_dir_all(to_channel.join(subdir))?;
        std::fs::copy(entry.path(), to_channel.join(&target))?;
        debug!(file = %target.display(), "copied artifact package");
        copied.push(target);
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryGitHub;
    use std::io::Write;

    fn request() -> ArtifactRequest {
        ArtifactRequest {
            github_token: "gh-token".to_string(),
            repository: "qiime2/q2-types".to_string(),
            run_id: "1001".to_string(),
            artifact_name: "linux-64".to_string(),
        }
    }

    fn record(name: &str, size: u64) -> ArtifactRecord {
        ArtifactRecord {
            id: 1,
            name: name.to_string(),
            size_in_bytes: size,
            archive_download_url: format!("https://example.invalid/{name}.zip"),
        }
    }

    fn sync() -> ArtifactSync {
        ArtifactSync::new(Arc::new(MemoryGitHub::new()), 100_000_000)
    }

    fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        for (name, body) in files {
            writer.start_file(*name, options).unwrap();
            writer.write_all(body).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_validate_rejects_bad_repository() {
        let mut req = request();
        req.repository = "qiime2".to_string();
        assert!(matches!(req.validate(), Err(GitHubError::InvalidRepository(_))));
        req.repository = "qiime2/".to_string();
        assert!(matches!(req.validate(), Err(GitHubError::InvalidRepository(_))));

        let mut req = request();
        req.run_id = String::new();
        assert!(matches!(req.validate(), Err(GitHubError::Missing(_))));
    }

    #[test]
    fn test_select_requires_exactly_one_match() {
        let s = sync();
        let records = vec![record("osx-64", 10)];
        assert!(matches!(
            s.select(&request(), &records),
            Err(GitHubError::ArtifactNotReady { found: 0, .. })
        ));

        let records = vec![record("linux-64", 10), record("linux-64", 12)];
        assert!(matches!(
            s.select(&request(), &records),
            Err(GitHubError::AmbiguousArtifact { found: 2, .. })
        ));

        let records = vec![record("osx-64", 10), record("linux-64", 12)];
        assert_eq!(s.select(&request(), &records).unwrap().size_in_bytes, 12);
    }

    #[test]
    fn test_select_rejects_oversize() {
        let records = vec![record("linux-64", 100_000_001)];
        assert!(matches!(
            sync().select(&request(), &records),
            Err(GitHubError::ArtifactTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_sync_copies_matching_packages_into_channel() {
        let github = Arc::new(MemoryGitHub::new());
        github.publish_artifact(
            "qiime2/q2-types",
            "1001",
            "linux-64",
            zip_bytes(&[
                ("linux-64/q2-types-2024.10.0-py310_0.tar.bz2", b"pkg"),
                ("linux-64/q2-other-2024.10.0-py310_0.tar.bz2", b"nope"),
                ("linux-64/repodata.json", b"{}"),
            ]),
        );
        let channel = tempfile::tempdir().unwrap();

        let sync = ArtifactSync::new(github.clone(), 100_000_000);
        let copied = sync.sync(&request(), "q2-types", channel.path()).await.unwrap();

        assert_eq!(
            copied,
            vec![PathBuf::from("linux-64/q2-types-2024.10.0-py310_0.tar.bz2")]
        );
        assert!(channel.path().join("osx-64").is_dir());
        assert!(!channel
            .path()
            .join("linux-64/q2-other-2024.10.0-py310_0.tar.bz2")
            .exists());
    }

    #[tokio::test]
    async fn test_download_failure_is_not_ready() {
        let github = Arc::new(MemoryGitHub::new());
        github.list_only_artifact("qiime2/q2-types", "1001", record("linux-64", 10));
        let scratch = tempfile::tempdir().unwrap();

        let err = ArtifactSync::new(github, 100_000_000)
            .fetch(&request(), scratch.path())
            .await
            .unwrap_err();
        assert!(matches!(err, GitHubError::ArtifactNotReady { found: 1, .. }));
    }

    #[tokio::test]
    async fn test_fetch_refuses_to_overwrite() {
        let github = Arc::new(MemoryGitHub::new());
        github.publish_artifact("qiime2/q2-types", "1001", "linux-64", zip_bytes(&[]));
        let scratch = tempfile::tempdir().unwrap();
        std::fs::write(scratch.path().join("linux-64"), b"old").unwrap();

        let err = ArtifactSync::new(github, 100_000_000)
            .fetch(&request(), scratch.path())
            .await
            .unwrap_err();
        assert!(matches!(err, GitHubError::WouldOverwrite(_)));
    }
}
