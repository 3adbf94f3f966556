//! Package channels on the local filesystem.
//!
//! A channel is a directory with one subdirectory per architecture. Creation
//! is idempotent and copies never lock: file names are unique per build.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use globset::Glob;
use library_state::Arch;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::ChannelError;

/// Create `<channel>/linux-64` and `<channel>/osx-64` if missing.
pub async fn bootstrap(channel: &Path) -> Result<(), ChannelError> {
    for arch in Arch::ALL {
        tokio::fs::create_dir_all(channel.join(arch.subdir())).await?;
    }
    Ok(())
}

/// Locate the one artifact per architecture for each `package → version`.
///
/// Matches `<package>-<version>-*.tar.bz2` inside every architecture
/// directory of `channel`. Returns channel-relative paths. Anything other
/// than exactly one match is a conflict.
pub async fn find_package_files<'a, I>(channel: &Path, packages: I) -> Result<Vec<PathBuf>, ChannelError>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut files = Vec::new();
    for (package, version) in packages {
        let pattern = format!("{package}-{version}-*.tar.bz2");
        let matcher = Glob::new(&pattern)
            .map_err(|e| ChannelError::Pattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?
            .compile_matcher();

        for arch in Arch::ALL {
            let dir = channel.join(arch.subdir());
            let mut matches = Vec::new();
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                if entry.file_type().await?.is_file() && matcher.is_match(Path::new(&name)) {
                    matches.push(PathBuf::from(arch.subdir()).join(name));
                }
            }
            if matches.len() != 1 {
                return Err(ChannelError::FileCountMismatch {
                    pattern,
                    dir: dir.display().to_string(),
                    found: matches.len(),
                });
            }
            files.append(&mut matches);
        }
    }
    files.sort();
    Ok(files)
}

/// Copy channel-relative `files` from one channel into another.
pub async fn copy_files(from: &Path, to: &Path, files: &[PathBuf]) -> Result<usize, ChannelError> {
    bootstrap(to).await?;
    for file in files {
        tokio::fs::copy(from.join(file), to.join(file)).await?;
        debug!(file = %file.display(), to = %to.display(), "copied package file");
    }
    Ok(files.len())
}

/// Regenerates a channel's package index.
#[async_trait]
pub trait ChannelIndexer: Send + Sync {
    async fn reindex(&self, channel: &Path, channel_name: &str) -> Result<(), ChannelError>;
}

/// Runs an external index command: `<cmd...> <channel> --channel-name <name>`.
#[derive(Debug, Clone)]
pub struct CommandIndexer {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandIndexer {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

#[async_trait]
impl ChannelIndexer for CommandIndexer {
    async fn reindex(&self, channel: &Path, channel_name: &str) -> Result<(), ChannelError> {
        bootstrap(channel).await?;

        let (exe, args) = self.command.split_first().ok_or(ChannelError::EmptyCommand)?;
        let start = Instant::now();
        let child = Command::new(exe)
            .args(args)
            .arg(channel)
            .arg("--channel-name")
            .arg(channel_name)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ChannelError::Timeout {
                channel: channel_name.to_string(),
                secs: self.timeout.as_secs(),
            })??;

        if !output.status.success() {
            return Err(ChannelError::IndexFailed {
                channel: channel_name.to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!(
            channel = channel_name,
            duration_ms = start.elapsed().as_millis() as u64,
            "channel reindexed"
        );
        Ok(())
    }
}
