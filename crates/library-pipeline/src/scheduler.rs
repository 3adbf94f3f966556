//! Periodic jobs.
//!
//! Three timers (PR sweep, reindex, task-result cleanup) each fire a
//! [`Job`] on its own task, so a slow sweep never delays the next tick of
//! another timer. Ticks missed while the runtime was busy are skipped.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{error, info};

use crate::chain::Completed;
use crate::chains::Orchestrator;
use crate::error::Result;

/// A periodic job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    HandlePrs,
    Reindex,
    Cleanup,
}

impl Job {
    pub const ALL: [Job; 3] = [Job::HandlePrs, Job::Reindex, Job::Cleanup];

    pub fn as_str(&self) -> &'static str {
        match self {
            Job::HandlePrs => "handle_prs",
            Job::Reindex => "reindex",
            Job::Cleanup => "cleanup",
        }
    }

    /// Dispatch the job's chains and wait for all of them.
    pub async fn run(self, orchestrator: &Orchestrator) -> Result<JobOutcome> {
        let outcome = match self {
            Job::HandlePrs => JobOutcome::tally(orchestrator.handle_prs().await?.join().await),
            Job::Reindex => JobOutcome::tally(orchestrator.reindex_channels().await?.join().await),
            Job::Cleanup => JobOutcome::tally(vec![orchestrator.cleanup_task_results().await?]),
        };
        info!(
            job = self.as_str(),
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "periodic job finished"
        );
        Ok(outcome)
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How many of a job's chains finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobOutcome {
    pub succeeded: usize,
    pub failed: usize,
}

impl JobOutcome {
    fn tally<X>(results: Vec<Result<Completed<X>>>) -> Self {
        let failed = results.iter().filter(|r| r.is_err()).count();
        Self {
            succeeded: results.len() - failed,
            failed,
        }
    }
}

/// Drives the periodic jobs until shutdown.
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Fire jobs on their periods until `shutdown` resolves.
    ///
    /// The first firing of each job happens one full period after start.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        let settings = &self.orchestrator.services().settings;
        let mut sweep = ticker(settings.pr_sweep_period);
        let mut reindex = ticker(settings.reindex_period);
        let mut cleanup = ticker(settings.cleanup_period);
        tokio::pin!(shutdown);

        info!(
            pr_sweep_secs = settings.pr_sweep_period.as_secs(),
            reindex_secs = settings.reindex_period.as_secs(),
            cleanup_secs = settings.cleanup_period.as_secs(),
            "scheduler started"
        );
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = sweep.tick() => self.fire(Job::HandlePrs),
                _ = reindex.tick() => self.fire(Job::Reindex),
                _ = cleanup.tick() => self.fire(Job::Cleanup),
            }
        }
        info!("scheduler stopped");
    }

    fn fire(&self, job: Job) {
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            if let Err(e) = job.run(&orchestrator).await {
                error!(job = job.as_str(), error = %e, "periodic job could not be dispatched");
            }
        });
    }
}

fn ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}
