//! Immutable process configuration.
//!
//! Built once at startup and shared by reference; nothing reads the
//! environment after that.

use std::path::PathBuf;
use std::time::Duration;

use library_state::LockKey;

const MIN: u64 = 60;
const HOUR: u64 = 60 * MIN;

/// The git repository that holds recipes and receives integration PRs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrationRepo {
    pub owner: String,
    pub repo: String,
    /// Branch recipes are read from and PRs target.
    pub main_branch: String,
    /// Shared secret the distro promotion trigger must present.
    pub token: String,
}

impl IntegrationRepo {
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    pub fn pr_url(&self, number: u64) -> String {
        format!("https://github.com/{}/{}/pull/{}", self.owner, self.repo, number)
    }
}

/// Exponential backoff window for one class of step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryWindow {
    pub floor: Duration,
    pub ceiling: Duration,
    pub max_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Root of every channel directory (`<root>/<epoch>/<gate>[/<distro>]`).
    pub channel_root: PathBuf,
    pub github_token: String,
    pub github_api_url: String,
    pub integration_repo: IntegrationRepo,
    /// Delay between a trigger and its chain starting.
    pub dispatch_delay: Duration,
    pub artifact_retry: RetryWindow,
    pub git_retry: RetryWindow,
    pub pr_sweep_period: Duration,
    pub reindex_period: Duration,
    pub cleanup_period: Duration,
    /// Finished noisy task results older than this are purged.
    pub task_result_retention: Duration,
    /// Index command; the channel path and `--channel-name <name>` are appended.
    pub reindex_command: Vec<String>,
    pub reindex_timeout: Duration,
    pub recipe_lock: LockKey,
    pub artifact_size_limit: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            channel_root: PathBuf::from("/data/conda"),
            github_token: String::new(),
            github_api_url: "https://api.github.com".to_string(),
            integration_repo: IntegrationRepo {
                owner: "qiime2".to_string(),
                repo: "package-integration".to_string(),
                main_branch: "main".to_string(),
                token: String::new(),
            },
            dispatch_delay: Duration::from_secs(10 * MIN),
            artifact_retry: RetryWindow {
                floor: Duration::from_secs(3 * MIN),
                ceiling: Duration::from_secs(90 * MIN),
                max_retries: 12,
            },
            git_retry: RetryWindow {
                floor: Duration::from_secs(3 * MIN),
                ceiling: Duration::from_secs(2 * HOUR),
                max_retries: 12,
            },
            pr_sweep_period: Duration::from_secs(HOUR),
            reindex_period: Duration::from_secs(5 * MIN),
            cleanup_period: Duration::from_secs(24 * HOUR),
            task_result_retention: Duration::from_secs(24 * HOUR),
            reindex_command: vec!["conda".to_string(), "index".to_string()],
            reindex_timeout: Duration::from_secs(30 * MIN),
            recipe_lock: LockKey(42),
            artifact_size_limit: 100_000_000,
        }
    }
}

impl Settings {
    /// Build from environment variables, falling back to defaults.
    ///
    /// Reads:
    /// - LIBRARY_CHANNEL_ROOT
    /// - GITHUB_TOKEN, GITHUB_API_URL
    /// - INTEGRATION_REPO_OWNER, INTEGRATION_REPO_NAME, INTEGRATION_REPO_BRANCH,
    ///   INTEGRATION_REPO_TOKEN
    /// - LIBRARY_REINDEX_CMD (whitespace separated)
    /// - LIBRARY_DISPATCH_DELAY_SECS
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        if let Some(root) = var("LIBRARY_CHANNEL_ROOT") {
            settings.channel_root = PathBuf::from(root);
        }
        if let Some(token) = var("GITHUB_TOKEN") {
            settings.github_token = token;
        }
        if let Some(url) = var("GITHUB_API_URL") {
            settings.github_api_url = url.trim_end_matches('/').to_string();
        }
        if let Some(owner) = var("INTEGRATION_REPO_OWNER") {
            settings.integration_repo.owner = owner;
        }
        if let Some(repo) = var("INTEGRATION_REPO_NAME") {
            settings.integration_repo.repo = repo;
        }
        if let Some(branch) = var("INTEGRATION_REPO_BRANCH") {
            settings.integration_repo.main_branch = branch;
        }
        if let Some(token) = var("INTEGRATION_REPO_TOKEN") {
            settings.integration_repo.token = token;
        }
        if let Some(cmd) = var("LIBRARY_REINDEX_CMD") {
            settings.reindex_command = cmd.split_whitespace().map(str::to_string).collect();
        }
        if let Some(secs) = var("LIBRARY_DISPATCH_DELAY_SECS").and_then(|s| s.parse().ok()) {
            settings.dispatch_delay = Duration::from_secs(secs);
        }
        settings
    }

    pub fn with_channel_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.channel_root = root.into();
        self
    }

    pub fn with_github_token(mut self, token: impl Into<String>) -> Self {
        self.github_token = token.into();
        self
    }

    pub fn with_github_api_url(mut self, url: impl Into<String>) -> Self {
        self.github_api_url = url.into();
        self
    }

    pub fn with_integration_repo(mut self, repo: IntegrationRepo) -> Self {
        self.integration_repo = repo;
        self
    }

    pub fn with_dispatch_delay(mut self, delay: Duration) -> Self {
        self.dispatch_delay = delay;
        self
    }

    pub fn with_reindex_command(mut self, command: Vec<String>) -> Self {
        self.reindex_command = command;
        self
    }

    /// `<root>/<epoch>/tested`
    pub fn tested_channel(&self, epoch: &str) -> PathBuf {
        self.channel_root.join(epoch).join("tested")
    }

    /// `<root>/<epoch>/<gate>/<distro>`
    pub fn distro_channel(&self, epoch: &str, gate: &str, distro: &str) -> PathBuf {
        self.channel_root.join(epoch).join(gate).join(distro)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_pipeline_constants() {
        let s = Settings::default();
        assert_eq!(s.dispatch_delay, Duration::from_secs(600));
        assert_eq!(s.artifact_retry.floor, Duration::from_secs(180));
        assert_eq!(s.artifact_retry.ceiling, Duration::from_secs(5400));
        assert_eq!(s.git_retry.ceiling, Duration::from_secs(7200));
        assert_eq!(s.git_retry.max_retries, 12);
        assert_eq!(s.recipe_lock, LockKey(42));
        assert_eq!(s.artifact_size_limit, 100_000_000);
    }

    #[test]
    fn test_channel_paths() {
        let s = Settings::default().with_channel_root("/srv/conda");
        assert_eq!(s.tested_channel("2024.10"), PathBuf::from("/srv/conda/2024.10/tested"));
        assert_eq!(
            s.distro_channel("2024.10", "staged", "core"),
            PathBuf::from("/srv/conda/2024.10/staged/core")
        );
    }

    #[test]
    fn test_pr_url() {
        let repo = Settings::default().integration_repo;
        assert_eq!(
            repo.pr_url(12),
            "https://github.com/qiime2/package-integration/pull/12"
        );
        assert_eq!(repo.slug(), "qiime2/package-integration");
    }
}
