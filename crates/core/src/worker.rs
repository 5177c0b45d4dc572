//! Bounded background execution for restoration jobs.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, Instrument};
use uuid::Uuid;

/// Runs submitted futures with at most `limit` in flight.
///
/// Submission never waits for a permit; queued jobs wait inside their task.
#[derive(Clone)]
pub struct JobPool {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    limit: usize,
}

impl JobPool {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            tracker: TaskTracker::new(),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Jobs spawned and not yet finished (queued or running).
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    pub fn submit<F>(&self, label: &str, job: F) -> Uuid
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let job_id = Uuid::new_v4();
        let permits = self.permits.clone();
        let span = tracing::info_span!("job", %job_id, label = %label);

        self.tracker.spawn(
            async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                info!("Job started");
                job.await;
                info!("Job finished");
            }
            .instrument(span),
        );

        debug!(%job_id, label, pending = self.pending(), "Job queued");
        job_id
    }

    /// Stop accepting work and wait for everything already submitted.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn drain_waits_for_all_jobs() {
        let pool = JobPool::new(2);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let done = done.clone();
            pool.submit("count", async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(pool.pending(), 0);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_limit() {
        let pool = JobPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            pool.submit("peak", async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        pool.drain().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn zero_limit_is_clamped() {
        assert_eq!(JobPool::new(0).limit(), 1);
    }

    #[tokio::test]
    async fn submit_returns_distinct_ids() {
        let pool = JobPool::new(1);
        let a = pool.submit("a", async {});
        let b = pool.submit("b", async {});
        assert_ne!(a, b);
        pool.drain().await;
    }
}
