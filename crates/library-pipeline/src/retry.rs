//! Per-step retry policy with exponential backoff.

use std::time::Duration;

use library_core::{ErrorClass, RetryWindow, Settings, TransientKind};

/// Which transient failures a step retries, and how long it waits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    retry_on: Vec<TransientKind>,
    window: Option<RetryWindow>,
}

impl RetryPolicy {
    /// Fail on the first error.
    pub fn none() -> Self {
        Self {
            retry_on: Vec::new(),
            window: None,
        }
    }

    pub fn new(retry_on: impl Into<Vec<TransientKind>>, window: RetryWindow) -> Self {
        Self {
            retry_on: retry_on.into(),
            window: Some(window),
        }
    }

    /// Artifact fetches wait for CI uploads and ride out transport errors.
    pub fn artifact(settings: &Settings) -> Self {
        Self::new(
            [TransientKind::ArtifactNotReady, TransientKind::Transport],
            settings.artifact_retry,
        )
    }

    /// Git steps wait for the recipe lock and ride out transport errors.
    pub fn git(settings: &Settings) -> Self {
        Self::new(
            [TransientKind::LockNotReady, TransientKind::Transport],
            settings.git_retry,
        )
    }

    pub fn retries(&self, kind: TransientKind) -> bool {
        self.retry_on.contains(&kind)
    }

    /// Whether a failure of `class` on attempt `attempt` (1-based) runs again.
    pub fn should_retry(&self, class: ErrorClass, attempt: u32) -> bool {
        match (self.window, class.transient_kind()) {
            (Some(window), Some(kind)) => self.retries(kind) && attempt <= window.max_retries,
            _ => false,
        }
    }

    /// Wait before retry number `attempt`: `floor * 2^(attempt-1)`, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let Some(window) = self.window else {
            return Duration::ZERO;
        };
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        window
            .floor
            .checked_mul(factor)
            .map_or(window.ceiling, |d| d.min(window.ceiling))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_backoff_doubles_to_ceiling() {
        let policy = RetryPolicy::artifact(&Settings::default());
        let mins: Vec<u64> = (1..=7).map(|a| policy.delay(a).as_secs() / 60).collect();
        assert_eq!(mins, vec![3, 6, 12, 24, 48, 90, 90]);
        assert_eq!(policy.delay(40), Duration::from_secs(90 * 60));
    }

    #[test]
    fn test_git_backoff_ceiling_is_two_hours() {
        let policy = RetryPolicy::git(&Settings::default());
        assert_eq!(policy.delay(12), Duration::from_secs(2 * 60 * 60));
    }

    #[test]
    fn test_retry_set_is_per_step() {
        let settings = Settings::default();
        let artifact = RetryPolicy::artifact(&settings);
        let git = RetryPolicy::git(&settings);
        let lock_busy = ErrorClass::Transient(TransientKind::LockNotReady);

        assert!(git.should_retry(lock_busy, 1));
        assert!(!artifact.should_retry(lock_busy, 1));
        assert!(!git.should_retry(ErrorClass::Conflict, 1));
        assert!(!RetryPolicy::none().should_retry(lock_busy, 1));
    }

    #[test]
    fn test_retries_stop_after_budget() {
        let policy = RetryPolicy::git(&Settings::default());
        let busy = ErrorClass::Transient(TransientKind::LockNotReady);
        assert!(policy.should_retry(busy, 12));
        assert!(!policy.should_retry(busy, 13));
    }
}
