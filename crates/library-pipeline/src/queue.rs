//! Named worker queues.
//!
//! Steps declare the queue they run on; each queue bounds how many steps of
//! its category execute at once. Queues are categories, not priorities.
//! Chains and groups are dispatched onto the tokio runtime and never block
//! the caller.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

/// Step categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Queue {
    /// Database reads and writes.
    Db,
    /// Channel files, artifact downloads, reindexing.
    Packages,
    /// Integration repository reads and writes.
    Git,
    /// Housekeeping fired by the scheduler.
    Periodic,
}

impl Queue {
    pub const ALL: [Queue; 4] = [Queue::Db, Queue::Packages, Queue::Git, Queue::Periodic];

    pub fn as_str(&self) -> &'static str {
        match self {
            Queue::Db => "db",
            Queue::Packages => "packages",
            Queue::Git => "git",
            Queue::Periodic => "periodic",
        }
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-queue concurrency limits plus delayed dispatch.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    queues: Arc<HashMap<Queue, Arc<Semaphore>>>,
}

impl WorkerPool {
    /// Every queue gets `concurrency` workers.
    pub fn new(concurrency: usize) -> Self {
        Self::with_limits(Queue::ALL.map(|q| (q, concurrency)))
    }

    pub fn with_limits(limits: impl IntoIterator<Item = (Queue, usize)>) -> Self {
        let mut queues: HashMap<Queue, Arc<Semaphore>> = Queue::ALL
            .into_iter()
            .map(|q| (q, Arc::new(Semaphore::new(1))))
            .collect();
        for (queue, n) in limits {
            queues.insert(queue, Arc::new(Semaphore::new(n.max(1))));
        }
        Self {
            queues: Arc::new(queues),
        }
    }

    /// Wait for a free worker on `queue`.
    pub async fn acquire(&self, queue: Queue) -> Result<OwnedSemaphorePermit> {
        let semaphore = self
            .queues
            .get(&queue)
            .cloned()
            .ok_or(PipelineError::QueueClosed(queue))?;
        semaphore
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::QueueClosed(queue))
    }

    /// Free workers on `queue` right now.
    pub fn available(&self, queue: Queue) -> usize {
        self.queues.get(&queue).map_or(0, |s| s.available_permits())
    }

    /// Run `work` after `delay` in the background.
    pub fn dispatch<F>(&self, delay: Duration, work: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(async move {
            if !delay.is_zero() {
                debug!(delay_secs = delay.as_secs(), "dispatch delayed");
                tokio::time::sleep(delay).await;
            }
            work.await
        })
    }

    /// Run independent units of work after `delay`, with no ordering between them.
    pub fn dispatch_group<F, I>(&self, delay: Duration, work: I) -> Group<F::Output>
    where
        I: IntoIterator<Item = F>,
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let mut set = JoinSet::new();
        for unit in work {
            set.spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                unit.await
            });
        }
        Group { set }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(4)
    }
}

/// Handle to a dispatched group.
///
/// Dropping the handle detaches the members, they keep running. Only
/// [`Group::join`] waits for them.
#[derive(Debug)]
pub struct Group<T: 'static> {
    set: JoinSet<T>,
}

impl<T: 'static> Drop for Group<T> {
    fn drop(&mut self) {
        // A dropped JoinSet would abort every member.
        self.set.detach_all();
    }
}

impl<T: 'static> Group<T> {
    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Wait for every member; members that panicked are logged and omitted.
    pub async fn join(mut self) -> Vec<T> {
        let mut results = Vec::with_capacity(self.set.len());
        while let Some(joined) = self.set.join_next().await {
            match joined {
                Ok(value) => results.push(value),
                Err(e) => warn!(error = %e, "group member did not finish"),
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_queue_limits_concurrency() {
        let pool = WorkerPool::with_limits([(Queue::Git, 1)]);
        let permit = pool.acquire(Queue::Git).await.unwrap();
        assert_eq!(pool.available(Queue::Git), 0);
        drop(permit);
        assert_eq!(pool.available(Queue::Git), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_waits_for_delay() {
        let pool = WorkerPool::default();
        let start = tokio::time::Instant::now();
        let handle = pool.dispatch(Duration::from_secs(600), async { 7 });
        assert_eq!(handle.await.unwrap(), 7);
        assert!(start.elapsed() >= Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_group_runs_every_member() {
        let pool = WorkerPool::default();
        let counter = Arc::new(AtomicUsize::new(0));
        let work = (0..5).map(|i| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                i
            }
        });
        let group = pool.dispatch_group(Duration::ZERO, work);
        assert_eq!(group.len(), 5);
        let mut results = group.join().await;
        results.sort();
        assert_eq!(results, vec![0, 1, 2, 3, 4]);
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_group_keeps_running() {
        let pool = WorkerPool::default();
        let counter = Arc::new(AtomicUsize::new(0));
        let work = (0..3).map(|_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        drop(pool.dispatch_group(Duration::from_secs(600), work));

        tokio::time::sleep(Duration::from_secs(601)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
